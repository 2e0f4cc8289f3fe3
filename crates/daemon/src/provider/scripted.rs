// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// In-process provider with scripted answers, for tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tunnel_registry_common::Protocol;

use super::{Listener, ListenerSpec, ProviderError, ProviderSession, TunnelProvider};

enum Outcome {
    Url(String),
    Fail(String),
    Hang,
}

#[derive(Default)]
struct Script {
    outcomes: HashMap<String, VecDeque<Outcome>>,
    connect_failure: Option<String>,
    counter: u32,
    connects: usize,
    opened: Vec<ListenerSpec>,
    closed: Vec<String>,
}

/// Provider whose answers are queued per forwarding target
///
/// Unscripted opens get a fresh ephemeral URL, or the reserved domain when
/// one is requested. Clones share the same script and call log.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, forwards_to: &str, outcome: Outcome) {
        self.script
            .lock()
            .unwrap()
            .outcomes
            .entry(forwards_to.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn respond(&self, forwards_to: &str, url: &str) {
        self.push(forwards_to, Outcome::Url(url.to_string()));
    }

    pub fn fail(&self, forwards_to: &str, reason: &str) {
        self.push(forwards_to, Outcome::Fail(reason.to_string()));
    }

    pub fn hang(&self, forwards_to: &str) {
        self.push(forwards_to, Outcome::Hang);
    }

    pub fn fail_connect(&self, reason: &str) {
        self.script.lock().unwrap().connect_failure = Some(reason.to_string());
    }

    pub fn allow_connect(&self) {
        self.script.lock().unwrap().connect_failure = None;
    }

    pub fn connects(&self) -> usize {
        self.script.lock().unwrap().connects
    }

    pub fn opened(&self) -> Vec<ListenerSpec> {
        self.script.lock().unwrap().opened.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.script.lock().unwrap().closed.clone()
    }
}

#[async_trait]
impl TunnelProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let mut script = self.script.lock().unwrap();
        script.connects += 1;
        if let Some(reason) = &script.connect_failure {
            return Err(ProviderError::Connect(reason.clone()));
        }
        Ok(Arc::new(ScriptedSession {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    async fn open(&self, spec: &ListenerSpec) -> Result<Box<dyn Listener>, ProviderError> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.opened.push(spec.clone());
            script.counter += 1;
            let n = script.counter;

            match script
                .outcomes
                .get_mut(&spec.forwards_to)
                .and_then(|queue| queue.pop_front())
            {
                Some(outcome) => outcome,
                None => Outcome::Url(default_url(spec, n)),
            }
        };

        match outcome {
            Outcome::Url(url) => Ok(Box::new(ScriptedListener {
                url,
                metadata: spec
                    .metadata
                    .clone()
                    .unwrap_or_else(|| format!("scripted {} listener", spec.protocol)),
                script: self.script.clone(),
            })),
            Outcome::Fail(reason) => Err(ProviderError::Open {
                protocol: spec.protocol,
                forwards_to: spec.forwards_to.clone(),
                reason,
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

fn default_url(spec: &ListenerSpec, n: u32) -> String {
    match (&spec.domain, spec.protocol) {
        (Some(domain), Protocol::Http) => format!("https://{}", domain),
        (Some(domain), Protocol::Tcp) => format!("tcp://{}", domain),
        (None, Protocol::Http) => format!("https://ephemeral-{}.scripted.test", n),
        (None, Protocol::Tcp) => format!("tcp://0.tcp.scripted.test:{}", 20000 + n),
    }
}

struct ScriptedListener {
    url: String,
    metadata: String,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Listener for ScriptedListener {
    fn url(&self) -> &str {
        &self.url
    }

    fn metadata(&self) -> &str {
        &self.metadata
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        self.script.lock().unwrap().closed.push(self.url.clone());
        Ok(())
    }
}
