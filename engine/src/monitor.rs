//! Hypervisor monitor client.
//!
//! Line-delimited JSON over TCP, strictly synchronous: a mutex serializes
//! queries so at most one command is outstanding on the socket, and no
//! asynchronous notifications are consumed (event lines are skipped while
//! waiting for the response). A socket failure or garbled response poisons
//! the client; every later call fails until a fresh connect.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct Channel {
    reader: BufReader<TcpStream>,
    failed: bool,
}

pub struct MonitorClient {
    channel: Mutex<Channel>,
    seq: AtomicU64,
}

impl MonitorClient {
    /// Connects, reads the greeting banner, and negotiates capabilities.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_timeout(host, port, DEFAULT_TIMEOUT)
    }

    pub fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(Error::Network)?
            .next()
            .ok_or(Error::NotConfigured("monitor address does not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(Error::Network)?;
        stream.set_read_timeout(Some(timeout)).map_err(Error::Network)?;
        stream.set_write_timeout(Some(timeout)).map_err(Error::Network)?;

        let mut reader = BufReader::new(stream);

        // Greeting banner: {"QMP": {...}}
        let mut greeting = String::new();
        reader.read_line(&mut greeting).map_err(Error::Network)?;
        let parsed: Value = serde_json::from_str(&greeting)
            .map_err(|e| Error::Protocol(format!("bad greeting: {e}")))?;
        if parsed.get("QMP").is_none() {
            return Err(Error::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim()
            )));
        }
        info!("connected to monitor at {addr}");

        let client = MonitorClient {
            channel: Mutex::new(Channel {
                reader,
                failed: false,
            }),
            seq: AtomicU64::new(0),
        };
        client.query(json!({"execute": "qmp_capabilities"}))?;
        Ok(client)
    }

    /// True once a network or protocol failure has poisoned the client.
    pub fn is_failed(&self) -> bool {
        self.channel.lock().map(|c| c.failed).unwrap_or(true)
    }

    /// Sends one command and blocks for its response. Returns the command's
    /// `return` value; a monitor-reported error becomes `Protocol` without
    /// poisoning the client (the socket is still in a known state).
    pub fn query(&self, command: Value) -> Result<Value> {
        let mut chan = self
            .channel
            .lock()
            .map_err(|_| Error::NotConfigured("monitor client lock poisoned"))?;
        if chan.failed {
            return Err(Error::NotConfigured("monitor client degraded; reconnect"));
        }

        let line = command.to_string();
        debug!("monitor <- {line}");
        let written = (|| {
            let stream = chan.reader.get_mut();
            stream.write_all(line.as_bytes())?;
            stream.write_all(b"\n")?;
            stream.flush()
        })();
        if let Err(e) = written {
            chan.failed = true;
            return Err(Error::Network(e));
        }

        loop {
            let mut buf = String::new();
            match chan.reader.read_line(&mut buf) {
                Ok(0) => {
                    chan.failed = true;
                    return Err(Error::Protocol("monitor closed the connection".into()));
                }
                Ok(_) => {}
                Err(e) => {
                    chan.failed = true;
                    return Err(Error::Network(e));
                }
            }
            debug!("monitor -> {}", buf.trim_end());
            match classify_response_line(&buf) {
                Ok(Some(ResponseLine::Return(v))) => return Ok(v),
                Ok(Some(ResponseLine::CommandError(desc))) => {
                    return Err(Error::Protocol(desc));
                }
                Ok(None) => continue, // async event, not ours
                Err(e) => {
                    chan.failed = true;
                    return Err(e);
                }
            }
        }
    }

    /// Fetches the flat memory-tree dump as raw text.
    pub fn query_memory_tree(&self) -> Result<String> {
        let value = self.query(json!({
            "execute": "human-monitor-command",
            "arguments": {"command-line": "info mtree -f"}
        }))?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::Protocol("memory tree response was not text".into()))
    }

    /// Architecture string of the target (`aarch64`, `x86_64`, ...).
    pub fn query_target_arch(&self) -> Result<String> {
        let value = self.query(json!({"execute": "query-target"}))?;
        value
            .get("arch")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::Protocol("query-target returned no arch".into()))
    }

    /// GVA→GPA through the monitor's translation extension. `Unmapped` when
    /// the monitor reports the address invalid; `Protocol` when the command
    /// is unsupported.
    pub fn translate_gva(&self, cpu_index: u32, gva: u64, root: Option<u64>) -> Result<u64> {
        let mut args = json!({"cpu-index": cpu_index, "addr": gva});
        if let Some(ttbr) = root {
            args["ttbr"] = json!(ttbr);
        }
        let value = self.query(json!({"execute": "query-va2pa", "arguments": args}))?;
        let valid = value.get("valid").and_then(Value::as_bool).unwrap_or(false);
        if !valid {
            return Err(Error::Unmapped {
                addr: gva,
                space: "guest-virtual",
            });
        }
        value
            .get("phys")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Protocol("va2pa response missing phys".into()))
    }

    /// Kernel "current task" pointer plus translation root, when the monitor
    /// carries the introspection extension.
    pub fn query_kernel_task(&self, cpu_index: u32) -> Result<(u64, u64)> {
        let value = self.query(json!({
            "execute": "query-kernel-task",
            "arguments": {"cpu-index": cpu_index}
        }))?;
        let task = value.get("task").and_then(Value::as_u64);
        let root = value.get("ttbr1").and_then(Value::as_u64);
        match (task, root) {
            (Some(t), Some(r)) => Ok((t, r)),
            _ => Err(Error::Protocol("kernel-task response incomplete".into())),
        }
    }

    /// Physical read through the monitor's memory-save command. Escalation
    /// path for addresses outside the mapped file; only useful when the
    /// monitor runs on this host (the dump lands in a local temp file).
    pub fn read_physical(&self, gpa: u64, size: usize) -> Result<Vec<u8>> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "vmscope-pmem-{}-{}.bin",
            std::process::id(),
            n
        ));
        let path_str = path.to_string_lossy().into_owned();
        let result = self.query(json!({
            "execute": "pmemsave",
            "arguments": {"val": gpa, "size": size, "filename": path_str}
        }));
        let bytes = result.and_then(|_| std::fs::read(&path).map_err(Error::Io));
        let _ = std::fs::remove_file(&path);
        let bytes = bytes?;
        if bytes.len() != size {
            warn!(
                "monitor physical read at {gpa:#x} returned {} of {size} bytes",
                bytes.len()
            );
        }
        Ok(bytes)
    }
}

enum ResponseLine {
    Return(Value),
    CommandError(String),
}

/// One line off the monitor socket: a response, a command error, or an
/// asynchronous event we skip. Garbled JSON is a protocol failure.
fn classify_response_line(line: &str) -> Result<Option<ResponseLine>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::Protocol(format!("unparseable monitor line: {e}")))?;
    if value.get("event").is_some() {
        return Ok(None);
    }
    if let Some(ret) = value.get("return") {
        return Ok(Some(ResponseLine::Return(ret.clone())));
    }
    if let Some(err) = value.get("error") {
        let desc = err
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unspecified monitor error");
        return Ok(Some(ResponseLine::CommandError(desc.to_owned())));
    }
    Err(Error::Protocol(format!(
        "monitor line is neither return, error nor event: {trimmed}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_skipped() {
        let line = r#"{"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 2}}"#;
        assert!(matches!(classify_response_line(line), Ok(None)));
        assert!(matches!(classify_response_line("  \n"), Ok(None)));
    }

    #[test]
    fn returns_and_errors_are_classified() {
        match classify_response_line(r#"{"return": {"arch": "aarch64"}}"#) {
            Ok(Some(ResponseLine::Return(v))) => assert_eq!(v["arch"], "aarch64"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        match classify_response_line(r#"{"error": {"class": "CommandNotFound", "desc": "no such command"}}"#)
        {
            Ok(Some(ResponseLine::CommandError(desc))) => assert_eq!(desc, "no such command"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            classify_response_line("(qemu) not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            classify_response_line(r#"{"neither": 1}"#),
            Err(Error::Protocol(_))
        ));
    }
}
