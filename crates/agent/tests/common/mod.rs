#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use geotrack_agent::{
    BackgroundTaskScheduler, FixedProvider, KeyValueStore, LocationProvider, LocationTransport,
    MemoryKvStore, PermissionGate, StaticPermissionGate, TrackerConfig, TrackerDeps,
    TransportError,
};
use geotrack_core::{Clock, LocationPayload, ManualClock};

pub const T0: i64 = 1_700_000_000_000;

/// Answers from a script, then with `fallback`; records every call in order.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<u16>>,
    fallback: Mutex<u16>,
    calls: Mutex<Vec<(LocationPayload, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn always(status: u16) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(status),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(statuses: &[u16], fallback: u16) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(statuses.iter().copied().collect()),
            fallback: Mutex::new(fallback),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fallback(&self, status: u16) {
        *self.fallback.lock().unwrap() = status;
    }

    pub fn calls(&self) -> Vec<(LocationPayload, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<LocationPayload> {
        self.calls().into_iter().map(|(p, _)| p).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LocationTransport for ScriptedTransport {
    async fn post_location(
        &self,
        payload: &LocationPayload,
        bearer_token: Option<&str>,
    ) -> Result<u16, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((payload.clone(), bearer_token.map(str::to_string)));
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(*self.fallback.lock().unwrap()))
    }
}

/// Records register/unregister calls; optionally fails registration.
#[derive(Default)]
pub struct RecordingScheduler {
    pub fail_register: bool,
    pub events: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    pub fn failing() -> Self {
        Self {
            fail_register: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackgroundTaskScheduler for RecordingScheduler {
    async fn register(&self, user_id: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("register:{user_id}"));
        if self.fail_register {
            anyhow::bail!("background execution unavailable");
        }
        Ok(())
    }

    async fn unregister(&self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("unregister".to_string());
        Ok(())
    }
}

pub struct Harness {
    pub kv: Arc<dyn KeyValueStore>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
}

impl Harness {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self {
            kv: Arc::new(MemoryKvStore::new()),
            clock: Arc::new(ManualClock::new(T0)),
            transport,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn deps(&self) -> TrackerDeps {
        self.deps_with(
            Arc::new(FixedProvider::new(-12.04, -77.04, self.clock())),
            Arc::new(StaticPermissionGate::granted()),
        )
    }

    pub fn deps_with(
        &self,
        provider: Arc<dyn LocationProvider>,
        permissions: Arc<dyn PermissionGate>,
    ) -> TrackerDeps {
        TrackerDeps::assemble(
            &TrackerConfig::default(),
            self.kv.clone(),
            provider,
            permissions,
            self.transport.clone(),
            self.clock(),
        )
    }
}

/// Lets spawned tasks run; with paused time this also advances the clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
