//! The hypervisor boundary.
//!
//! The supervisor needs one answer from libvirt: which of our domains are
//! running right now. Asking the hypervisor directly (rather than the KV
//! store, or the existence of instance directories) is deliberate: powered
//! off instances still have directories, and polling the store for this
//! from every node created real load. The low-level bindings stay out of
//! this tree; the shipped implementation drives the `virsh` CLI.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use crate::ChannelError;

/// Domains in these power states should not have a side-channel monitor.
pub const INACTIVE_POWER_STATES: &[&str] = &["off", "crashed", "paused"];

/// Our domains are named `sf:<instance_uuid>`.
pub fn instance_uuid_from_domain(domain_name: &str) -> Option<&str> {
    let (prefix, uuid) = domain_name.split_once(':')?;
    if prefix != "sf" || uuid.is_empty() {
        return None;
    }
    Some(uuid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub power_state: String,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Every domain of ours the hypervisor knows about, with its power
    /// state, whether running or not.
    async fn domains(&self) -> Result<Vec<Domain>, ChannelError>;
}

/// Production implementation: `virsh list` plus a `domstate` per domain.
pub struct LibvirtCli {
    connect_uri: String,
}

impl LibvirtCli {
    pub fn new(connect_uri: impl Into<String>) -> Self {
        Self {
            connect_uri: connect_uri.into(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<String, ChannelError> {
        let output = tokio::process::Command::new("virsh")
            .arg("--connect")
            .arg(&self.connect_uri)
            .args(args)
            .output()
            .await
            .map_err(|err| ChannelError::Hypervisor(format!("virsh failed to run: {err}")))?;

        if !output.status.success() {
            return Err(ChannelError::Hypervisor(format!(
                "virsh {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn normalize_state(raw: &str) -> String {
        match raw.trim() {
            "shut off" => "off".to_owned(),
            "in shutdown" => "off".to_owned(),
            other => other.to_owned(),
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtCli {
    async fn domains(&self) -> Result<Vec<Domain>, ChannelError> {
        let listing = self.virsh(&["list", "--all", "--name"]).await?;

        let mut domains = Vec::new();
        for name in listing.lines().map(str::trim).filter(|name| !name.is_empty()) {
            if instance_uuid_from_domain(name).is_none() {
                continue;
            }

            match self.virsh(&["domstate", name]).await {
                Ok(state) => domains.push(Domain {
                    name: name.to_owned(),
                    power_state: Self::normalize_state(&state),
                }),
                Err(err) => {
                    // The domain may have vanished between the two calls.
                    warn!(domain = name, error = %err, "cannot read domain state");
                }
            }
        }
        Ok(domains)
    }
}

/// Test double with a settable domain list.
#[derive(Debug, Clone, Default)]
pub struct MockHypervisor {
    domains: Arc<Mutex<Vec<Domain>>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_domains(&self, domains: Vec<Domain>) {
        *self
            .domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = domains;
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn domains(&self) -> Result<Vec<Domain>, ChannelError> {
        Ok(self
            .domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
