//! Session traffic reports exported as JSON for CI artifacts.
//!
//! Soak and scenario runs snapshot socket counters at the end of a run and
//! write them next to the test output for regression tracking.

use crate::harness::LoopbackSession;
use anyhow::Result;
use bomberboy_net::SocketStats;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Top-level traffic report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficReport {
    /// Run identifier.
    pub test_name: String,

    /// Timestamp when the report was built (RFC 3339).
    pub timestamp: String,

    /// Overall run result.
    pub result: TestResult,

    /// Host socket counters.
    pub host: HostTraffic,

    /// One entry per client, in join order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<ClientTraffic>,

    /// Wall-clock duration of the run in seconds.
    pub duration_seconds: f64,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    /// Every check passed.
    Pass,
    /// At least one check failed.
    Fail,
    /// The run did not execute.
    Skip,
}

/// Counters for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketTraffic {
    /// Frames or datagrams sent.
    pub frames_sent: u64,
    /// Frames or datagrams received.
    pub frames_received: u64,
    /// Outgoing datagrams dropped by a loss conditioner.
    pub datagrams_dropped: u64,
    /// Incoming datagrams rejected as malformed or unsolicited.
    pub datagrams_rejected: u64,
}

impl From<SocketStats> for SocketTraffic {
    fn from(stats: SocketStats) -> Self {
        Self {
            frames_sent: stats.frames_sent,
            frames_received: stats.frames_received,
            datagrams_dropped: stats.datagrams_dropped,
            datagrams_rejected: stats.datagrams_rejected,
        }
    }
}

/// Host-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTraffic {
    /// Clients connected when the report was taken.
    pub connected_clients: usize,
    /// Stream listener counters.
    pub reliable: SocketTraffic,
    /// Datagram socket counters.
    pub unreliable: SocketTraffic,
}

/// Client-side counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTraffic {
    /// Assigned player id, if still connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<u16>,
    /// Malformed frames received from the host.
    pub malformed_frames: u32,
    /// Datagram socket counters.
    pub unreliable: SocketTraffic,
}

/// Builder for [`TrafficReport`].
pub struct TrafficReportBuilder {
    report: TrafficReport,
}

impl TrafficReportBuilder {
    /// Start a passing report named `test_name`.
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            report: TrafficReport {
                test_name: test_name.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                result: TestResult::Pass,
                host: HostTraffic::default(),
                clients: Vec::new(),
                duration_seconds: 0.0,
            },
        }
    }

    /// Set the run result.
    pub fn result(mut self, result: TestResult) -> Self {
        self.report.result = result;
        self
    }

    /// Set the run duration.
    pub fn duration_seconds(mut self, seconds: f64) -> Self {
        self.report.duration_seconds = seconds;
        self
    }

    /// Copy every counter from a loopback session.
    pub fn session(mut self, session: &LoopbackSession) -> Self {
        self.report.host = HostTraffic {
            connected_clients: session.host.client_count(),
            reliable: session.host.reliable_stats().into(),
            unreliable: session.host.unreliable_stats().into(),
        };
        self.report.clients = session
            .clients
            .iter()
            .map(|client| ClientTraffic {
                player_id: client.player_id(),
                malformed_frames: client.session.malformed_frames(),
                unreliable: client.session.unreliable_stats().into(),
            })
            .collect();
        self
    }

    /// Build the report.
    pub fn build(self) -> TrafficReport {
        self.report
    }
}

/// Writes traffic reports as pretty JSON.
pub struct MetricsSink {
    path: PathBuf,
}

impl MetricsSink {
    /// Sink writing to `path`, creating parent directories as needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Replace the file's contents with `report`.
    pub fn write(&self, report: &TrafficReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
