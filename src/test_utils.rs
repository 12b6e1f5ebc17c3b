#![cfg(test)] // only compiled when running tests

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    ipfs::IpfsClient,
    model::{Cid, RemotePinStatus},
};

/// In-memory daemon with knobs for latency and failures. Tracks per-CID call
/// counts and flags any moment where two calls for one CID overlap.
#[derive(Default)]
pub struct MockIpfs {
    slow: HashMap<String, Duration>,
    failing: HashSet<String>,
    pub pin_ls_all_result: Option<HashMap<String, RemotePinStatus>>,
    pub pin_ls_single_pinned: HashSet<String>,
    pub pin_ls_single_failing: HashSet<String>,
    calls: Mutex<Calls>,
    active: Arc<Mutex<HashSet<String>>>,
    overlap: Arc<AtomicBool>,
}

#[derive(Default)]
struct Calls {
    pin: HashMap<String, usize>,
    unpin: HashMap<String, usize>,
    order: Vec<String>,
    pin_ls_all: usize,
    pin_ls_single: usize,
}

/// Clears the in-flight marker even when the call future is dropped.
struct InFlight {
    cid: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.cid);
    }
}

impl MockIpfs {
    pub fn with_slow(mut self, cid: &str, delay: Duration) -> Self {
        self.slow.insert(cid.to_string(), delay);
        self
    }

    pub fn with_failing(mut self, cid: &str) -> Self {
        self.failing.insert(cid.to_string());
        self
    }

    pub fn with_pin_ls_all(mut self, pins: &[(&str, RemotePinStatus)]) -> Self {
        self.pin_ls_all_result = Some(pins.iter().map(|(c, s)| (c.to_string(), *s)).collect());
        self
    }

    pub fn with_pinned(mut self, cids: &[&str]) -> Self {
        self.pin_ls_single_pinned = cids.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn pin_calls(&self, cid: &str) -> usize {
        self.calls.lock().unwrap().pin.get(cid).copied().unwrap_or(0)
    }

    pub fn unpin_calls(&self, cid: &str) -> usize {
        self.calls.lock().unwrap().unpin.get(cid).copied().unwrap_or(0)
    }

    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().unwrap().order.clone()
    }

    pub fn pin_ls_all_calls(&self) -> usize {
        self.calls.lock().unwrap().pin_ls_all
    }

    pub fn pin_ls_single_calls(&self) -> usize {
        self.calls.lock().unwrap().pin_ls_single
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    async fn call(&self, cid: &Cid, op: &str) -> Result<()> {
        let key = cid.to_string();
        {
            let mut calls = self.calls.lock().unwrap();
            let counter = if op == "pin" {
                &mut calls.pin
            } else {
                &mut calls.unpin
            };
            *counter.entry(key.clone()).or_default() += 1;
            calls.order.push(key.clone());
        }

        if !self.active.lock().unwrap().insert(key.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let _guard = InFlight {
            cid: key.clone(),
            active: self.active.clone(),
        };

        if let Some(delay) = self.slow.get(&key) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&key) {
            anyhow::bail!("mock {op} failure for {key}");
        }
        Ok(())
    }
}

#[async_trait]
impl IpfsClient for MockIpfs {
    async fn pin_add(&self, cid: &Cid) -> Result<()> {
        self.call(cid, "pin").await
    }

    async fn pin_rm(&self, cid: &Cid) -> Result<()> {
        self.call(cid, "unpin").await
    }

    async fn pin_ls_all(&self) -> Result<HashMap<String, RemotePinStatus>> {
        self.calls.lock().unwrap().pin_ls_all += 1;
        match &self.pin_ls_all_result {
            Some(v) => Ok(v.clone()),
            None => Err(anyhow::anyhow!("pin ls unavailable")),
        }
    }

    async fn pin_ls_single(&self, cid: &Cid) -> Result<RemotePinStatus> {
        self.calls.lock().unwrap().pin_ls_single += 1;
        if self.pin_ls_single_failing.contains(cid.as_str()) {
            anyhow::bail!("pin ls failed for {cid}");
        }
        if self.pin_ls_single_pinned.contains(cid.as_str()) {
            Ok(RemotePinStatus::Recursive)
        } else {
            Ok(RemotePinStatus::Unpinned)
        }
    }
}
