//! Performance test: repeated latency/throughput probes against one target, emitted as CSV rows.

use super::DispatchError;
use crate::gateway::{EventSink, OutboundEvent, PerformanceRequest};
use crate::supervisor::{run_captured, Session, SessionRegistry, SpawnError};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// Payload sizes for the throughput columns, in bytes.
pub const THROUGHPUT_SIZES: [u32; 4] = [32768, 65536, 131072, 1048575];

/// Resolve the target to an address, preferring IPv4.
pub async fn resolve_target(target: &str, port: u16) -> Result<IpAddr, DispatchError> {
    let invalid = |reason: String| DispatchError::TargetInvalid {
        label: "target",
        target: target.to_string(),
        reason,
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target, port))
        .await
        .map_err(|e| invalid(format!("LookupError - {}", e)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| invalid("LookupError - no addresses".to_string()))
}

pub fn csv_header(latency: bool, bandwidth: bool) -> String {
    let mut header = String::from("source_host, target_host");
    if latency {
        header.push_str(", avg_latency_usec");
    }
    if bandwidth {
        header.push_str(", 32k_throughput_mbits, 64k_throughput_mbits, 128k_throughput_mbits, 1M_throughput_mbits");
    }
    header.push('\n');
    header
}

/// Average latency from `ping-pong` output; empty when absent.
pub fn parse_latency(output: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    capture(RE.get_or_init(|| Regex::new(r"avg-latency=(.*)\(std-dev=").ok()).as_ref(), output)
}

/// Megabits per second from `throughput` output; empty when absent.
pub fn parse_throughput(output: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    capture(RE.get_or_init(|| Regex::new(r"MBps \((.*)Mbps").ok()).as_ref(), output)
}

fn capture(re: Option<&Regex>, output: &str) -> String {
    re.and_then(|re| re.captures(output))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Probe invocation and knobs for one performance test.
pub struct PerformanceRun<'a> {
    pub registry: &'a SessionRegistry,
    pub session: &'a Session,
    pub probe: &'a str,
    pub max_attempts: u32,
    pub sink: &'a dyn EventSink,
}

impl PerformanceRun<'_> {
    /// Emit the header, then one CSV row per run. `address` is the resolved target.
    /// A halt or a newer run for the session stops the test before its next measurement.
    pub async fn run(&self, req: &PerformanceRequest, address: IpAddr) -> Result<(), DispatchError> {
        let run = match self.registry.take_over(self.session).await {
            Some(current) => current.clone(),
            None => return Err(DispatchError::Halted),
        };
        let id = req.id.as_str();
        self.sink.emit(OutboundEvent::stdout(id, csv_header(req.latency, req.bandwidth)));

        for i in 0..req.runcount {
            log::info!("running performance test ({}/{})", i + 1, req.runcount);
            self.sink.emit(OutboundEvent::stdout(
                id,
                format!("{}, {}", req.source_label, req.target_label),
            ));
            if req.latency {
                let cmd = format!("{} ping-pong --tcp -i {} -p {}", self.probe, address, req.port);
                let value = self.measure(&run, id, &req.target, &cmd, parse_latency).await?;
                self.sink.emit(OutboundEvent::stdout(id, format!(", {}", value)));
            }
            if req.bandwidth {
                for size in THROUGHPUT_SIZES {
                    let cmd = format!(
                        "{} throughput --tcp -i {} -p {} -m {}",
                        self.probe, address, req.port, size
                    );
                    let value = self.measure(&run, id, &req.target, &cmd, parse_throughput).await?;
                    self.sink.emit(OutboundEvent::stdout(id, format!(", {}", value)));
                }
            }
            self.sink.emit(OutboundEvent::stdout(id, "\n"));
        }
        Ok(())
    }

    /// Run `cmd` until it yields a metric, up to `max_attempts` times. Each failed
    /// attempt is reported on stderr.
    async fn measure(
        &self,
        run: &CancellationToken,
        id: &str,
        target: &str,
        cmd: &str,
        parse: fn(&str) -> String,
    ) -> Result<String, DispatchError> {
        let failed = |reason: String| DispatchError::Measurement {
            target: target.to_string(),
            reason,
        };
        for attempt in 1..=self.max_attempts.max(1) {
            log::info!("    test : {} (attempt {})", cmd, attempt);
            let out = match run_captured(self.registry, self.session, run, cmd).await {
                Ok(out) => out,
                Err(SpawnError::Cancelled) => return Err(DispatchError::Halted),
                Err(e) => return Err(failed(format!("SpawnError - {}", e))),
            };
            let value = parse(&out.stdout);
            log::info!("    output: {}: {}", out.status, value);
            if out.status > 0 || value.is_empty() {
                self.sink
                    .emit(OutboundEvent::stderr(id, format!("{}\n{}\n\n", cmd, out.stdout)));
            }
            if !value.is_empty() {
                return Ok(value);
            }
            if run.is_cancelled() {
                return Err(DispatchError::Halted);
            }
        }
        Err(failed(format!(
            "MeasurementError - no result from `{}` after {} attempts",
            cmd,
            self.max_attempts.max(1)
        )))
    }
}
