use std::{env, net::SocketAddr, time::Duration};

use anyhow::Context as _;

/// How the remote agent client reaches pods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortForwardMode {
    /// Port-forward only when not running inside a cluster
    Auto,
    Always,
    Never,
}

/// Operator configuration, read once from the environment at start-up
#[derive(Clone, Debug)]
pub struct Settings {
    /// Address of the metrics / diagnostics web server
    pub http_addr: SocketAddr,

    /// Reporter and field-manager name used for events and patches
    pub reporter: String,

    /// Requeue delay while a reconfiguration is upgrading or retrying
    pub config_reconcile_interval: Duration,

    /// Requeue delay for running operations whose progress is incomplete
    pub ops_requeue: Duration,

    pub port_forward: PortForwardMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            reporter: "kubeblocks-operator".into(),
            config_reconcile_interval: Duration::from_secs(1),
            ops_requeue: Duration::from_secs(60),
            port_forward: PortForwardMode::Auto,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut settings = Settings::default();

        if let Some(addr) = lookup("KB_HTTP_ADDR") {
            settings.http_addr = addr
                .parse()
                .with_context(|| format!("invalid KB_HTTP_ADDR {addr:?}"))?;
        }
        if let Some(reporter) = lookup("KB_REPORTER") {
            settings.reporter = reporter;
        }
        if let Some(secs) = lookup("KB_CONFIG_RECONCILE_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid KB_CONFIG_RECONCILE_INTERVAL_SECS {secs:?}"))?;
            settings.config_reconcile_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("KB_OPS_REQUEUE_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid KB_OPS_REQUEUE_SECS {secs:?}"))?;
            settings.ops_requeue = Duration::from_secs(secs);
        }
        if let Some(mode) = lookup("KB_AGENT_PORT_FORWARD") {
            settings.port_forward = match mode.as_str() {
                "auto" => PortForwardMode::Auto,
                "always" => PortForwardMode::Always,
                "never" => PortForwardMode::Never,
                other => anyhow::bail!("invalid KB_AGENT_PORT_FORWARD {other:?}"),
            };
        }

        Ok(settings)
    }
}
