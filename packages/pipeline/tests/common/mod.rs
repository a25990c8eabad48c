//! Shared test doubles.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use argus_core::kernel::envelope::InboundMessage;
use directory_client::{DirectoryError, DirectoryProvider, InviteInfo};

/// In-memory bus message with recorded settlement.
pub struct TestMessage {
    payload: Vec<u8>,
    delivered: Option<i64>,
    acked: AtomicBool,
    naks: Mutex<Vec<Duration>>,
}

impl TestMessage {
    pub fn json<T: Serialize>(value: &T, delivered: i64) -> Self {
        Self {
            payload: serde_json::to_vec(value).expect("test payload"),
            delivered: Some(delivered),
            acked: AtomicBool::new(false),
            naks: Mutex::new(Vec::new()),
        }
    }

    pub fn raw(payload: &[u8], delivered: Option<i64>) -> Self {
        Self {
            payload: payload.to_vec(),
            delivered,
            acked: AtomicBool::new(false),
            naks: Mutex::new(Vec::new()),
        }
    }

    pub fn was_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn nak_delays(&self) -> Vec<Duration> {
        self.naks.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboundMessage for TestMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivered(&self) -> Option<i64> {
        self.delivered
    }

    async fn ack(&self) -> Result<()> {
        self.acked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.naks.lock().unwrap().push(delay);
        Ok(())
    }
}

/// Directory provider that plays back a scripted response sequence.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<InviteInfo, DirectoryError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<InviteInfo, DirectoryError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryProvider for ScriptedProvider {
    async fn get(&self, _code: &str) -> Result<InviteInfo, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(DirectoryError::Network("script exhausted".into())))
    }
}

/// A resolved invite for the happy-path scripts.
pub fn invite(code: &str, name: &str, members: i64) -> InviteInfo {
    let mut info = InviteInfo {
        code: code.to_string(),
        approximate_member_count: members,
        ..Default::default()
    };
    info.guild.id = "G".to_string();
    info.guild.name = name.to_string();
    info.guild.icon = "i".to_string();
    info
}
