//! UDP receiver for the collectd binary protocol.
//!
//! Datagrams are forwarded to the storage worker untouched: each packet
//! becomes one write task whose parse callback (running on the worker)
//! decodes the parts, applies the metric filter and feeds the registry.
//!
//! Packets are sequences of parts, each `{u16 type; u16 len}` big-endian
//! followed by `len - 4` payload bytes. Numeric parts are big-endian u64
//! except GAUGE values, which are little-endian doubles. High-resolution
//! times carry 2^-30 s units and are shifted down to seconds.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use ringmon_core::codec::StoreType;
use ringmon_core::registry::Registry;
use ringmon_core::task::{Task, TaskQueue, WriteTask};

pub const DEFAULT_PORT: u16 = 25827;

/// Samples are snapped to this grid before they reach the store.
const DATA_INTERVAL: u32 = 5;

/// Buffered neighbours per series for DERIVE interpolation.
const HIST_LEN: usize = 3;

// part types from the collectd network protocol
const PART_HOST: u16 = 0x0000;
const PART_TIME: u16 = 0x0001;
const PART_PLUGIN: u16 = 0x0002;
const PART_PLUGIN_INSTANCE: u16 = 0x0003;
const PART_TYPE: u16 = 0x0004;
const PART_TYPE_INSTANCE: u16 = 0x0005;
const PART_VALUES: u16 = 0x0006;
const PART_INTERVAL: u16 = 0x0007;
const PART_TIME_HR: u16 = 0x0008;
const PART_INTERVAL_HR: u16 = 0x0009;

// value kinds inside a VALUES part
const VAL_COUNTER: u8 = 0;
const VAL_GAUGE: u8 = 1;
const VAL_DERIVE: u8 = 2;
const VAL_ABSOLUTE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValType {
    Counter,
    Gauge,
    Derive,
    Absolute,
}

impl ValType {
    fn parse(s: &str) -> Option<ValType> {
        match s {
            "COUNTER" => Some(ValType::Counter),
            "GAUGE" => Some(ValType::Gauge),
            "DERIVE" => Some(ValType::Derive),
            "ABSOLUTE" => Some(ValType::Absolute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct TypesdbVal {
    name: String,
    vtype: ValType,
    stype: StoreType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct HistVal {
    time: u32,
    val: f64,
}

/// One decoded metric record, accumulated part by part.
#[derive(Debug, Default)]
struct Record {
    host: String,
    plugin: String,
    instance: String,
    type_name: String,
    subtype: String,
    #[allow(dead_code)]
    interval: u32,
    time: u32,
    values: Vec<f64>,
}

pub struct CollectdReceiver {
    typesdb: HashMap<String, Vec<TypesdbVal>>,
    /// Buffered history per DERIVE series. Only the worker thread touches
    /// this (the parse callbacks run there), so the lock is uncontended.
    hist: Mutex<HashMap<String, [HistVal; HIST_LEN]>>,
}

impl CollectdReceiver {
    /// Loads the collectd `types.db` describing each type's value layout
    /// and ranges. Types with ranges the 16-bit codecs cannot hold are
    /// skipped with a warning.
    pub fn from_types_db(path: &Path) -> io::Result<CollectdReceiver> {
        let text = fs::read_to_string(path)?;
        let mut typesdb = HashMap::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_types_line(line) {
                Some((key, vals)) => {
                    typesdb.insert(key, vals);
                }
                None => {
                    debug!(line, "skipping types.db entry");
                }
            }
        }
        info!(path = %path.display(), types = typesdb.len(), "loaded types.db");
        Ok(CollectdReceiver { typesdb, hist: Mutex::new(HashMap::new()) })
    }

    /// Write-task callback: decodes one datagram and stores its records.
    pub fn parse(&self, data: &[u8], registry: &mut Registry) -> io::Result<()> {
        let mut rec = Record::default();
        let mut p = 0usize;
        while p + 4 <= data.len() {
            let ptype = u16::from_be_bytes([data[p], data[p + 1]]);
            let plen = u16::from_be_bytes([data[p + 2], data[p + 3]]) as usize;
            if plen < 4 || p + plen > data.len() {
                return Err(io::Error::other(format!("invalid packet part length {plen}")));
            }
            let pdata = &data[p + 4..p + plen];
            match ptype {
                PART_HOST => rec.host = parse_string(pdata),
                PART_PLUGIN => rec.plugin = parse_string(pdata),
                PART_PLUGIN_INSTANCE => rec.instance = parse_string(pdata),
                PART_TYPE => rec.type_name = parse_string(pdata),
                PART_TYPE_INSTANCE => rec.subtype = parse_string(pdata),
                PART_TIME_HR => rec.time = (parse_int(pdata)? >> 30) as u32,
                PART_TIME => rec.time = parse_int(pdata)? as u32,
                PART_INTERVAL_HR => rec.interval = (parse_int(pdata)? >> 30) as u32,
                PART_INTERVAL => rec.interval = parse_int(pdata)? as u32,
                PART_VALUES => match parse_values(pdata) {
                    Ok(values) => rec.values = values,
                    Err(e) => {
                        warn!(error = %e, "bad values part");
                        rec.values.clear();
                    }
                },
                _ => debug!(part = ptype, len = plen, "ignoring packet part"),
            }
            p += plen;
            if ptype == PART_VALUES && !rec.values.is_empty() {
                self.process(&mut rec, registry);
            }
        }
        Ok(())
    }

    /// Applies the metric filter and naming rules, then stores each value.
    fn process(&self, rec: &mut Record, registry: &mut Registry) {
        const ACCEPTED: [(&str, &str, &str); 4] = [
            ("interface", "if_octets", ""),
            ("cpu", "percent", "idle"),
            ("memory", "percent", "free"),
            ("load", "load", ""),
        ];
        if !ACCEPTED.contains(&(rec.plugin.as_str(), rec.type_name.as_str(), rec.subtype.as_str()))
        {
            return;
        }
        let Some(entry) = self.typesdb.get(&rec.type_name) else {
            warn!(type_name = %rec.type_name, "type missing from types.db");
            return;
        };
        if entry.len() != rec.values.len() {
            warn!(
                type_name = %rec.type_name,
                expected = entry.len(),
                got = rec.values.len(),
                "types.db value count mismatch"
            );
            return;
        }
        let mut typedb: Vec<TypesdbVal> = entry.clone();

        // special rules: only the 1-minute load, and idle/free become usage
        if rec.plugin == "load" && rec.type_name == "load" {
            rec.values.truncate(1);
            typedb.truncate(1);
        }
        if (rec.plugin == "cpu" && rec.type_name == "percent" && rec.subtype == "idle")
            || (rec.plugin == "memory" && rec.type_name == "percent" && rec.subtype == "free")
        {
            rec.subtype = "usage".to_string();
            rec.values[0] = 100.0 - rec.values[0];
        }

        for (i, td) in typedb.iter().enumerate() {
            let mut name = format!("{}.{}", rec.host, rec.plugin);
            for part in [&rec.instance, &rec.type_name, &rec.subtype] {
                if !part.is_empty() {
                    name.push('.');
                    name.push_str(part);
                }
            }
            if typedb.len() > 1 {
                name.push('.');
                name.push_str(&td.name);
            }
            let time = (rec.time + DATA_INTERVAL / 2) / DATA_INTERVAL * DATA_INTERVAL;
            let value = rec.values[i];
            if td.vtype == ValType::Derive {
                self.add_derive(&name, time, value, td.stype, registry);
            } else if let Err(e) = registry.addv(&name, time, value, td.stype) {
                warn!(series = %name, error = %e, "store failed");
            }
        }
    }

    /// DERIVE samples are cumulative counters: convert neighbouring pairs
    /// into per-interval averages and store those. A 3-slot history per
    /// series lets moderately out-of-order packets still interpolate both
    /// towards the previous and the next buffered sample.
    fn add_derive(
        &self,
        name: &str,
        time: u32,
        value: f64,
        stype: StoreType,
        registry: &mut Registry,
    ) {
        let mut hist = self.hist.lock().unwrap();
        let buf = hist.entry(name.to_string()).or_default();
        if time < buf[0].time {
            warn!(series = %name, time, "outdated derive sample");
            return;
        }
        let mut idx = 0;
        while idx < HIST_LEN && buf[idx].time < time {
            idx += 1;
        }
        if idx < HIST_LEN && buf[idx].time == time {
            return; // duplicate delivery
        }
        idx -= 1;
        if time - buf[idx].time <= 60 && buf[idx].val <= value {
            let avg = (value - buf[idx].val) / (time - buf[idx].time) as f64;
            let mut t = buf[idx].time + DATA_INTERVAL;
            while t <= time {
                if let Err(e) = registry.addv(name, t, avg, stype) {
                    warn!(series = %name, error = %e, "store failed");
                }
                t += DATA_INTERVAL;
            }
        }
        if idx < HIST_LEN - 1 && buf[idx + 1].time - time <= 60 && value <= buf[idx + 1].val {
            let avg = (buf[idx + 1].val - value) / (buf[idx + 1].time - time) as f64;
            let mut t = time + DATA_INTERVAL;
            while t <= buf[idx + 1].time {
                if let Err(e) = registry.addv(name, t, avg, stype) {
                    warn!(series = %name, error = %e, "store failed");
                }
                t += DATA_INTERVAL;
            }
        }
        buf[0] = HistVal { time, val: value };
        buf.sort_by_key(|h| h.time);
    }
}

/// One `name  val:TYPE:min:max[, ...]` line. Returns `None` for lines the
/// store cannot represent (negative minima beyond f16, unbounded negative
/// ranges) or that do not parse.
fn parse_types_line(line: &str) -> Option<(String, Vec<TypesdbVal>)> {
    let (key, rest) = line.split_once(char::is_whitespace)?;
    let mut vals = Vec::new();
    for spec in rest.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let mut fields = spec.split(':');
        let name = fields.next()?;
        let vtype = ValType::parse(fields.next()?)?;
        let min = fields.next()?;
        let max = fields.next()?;
        if min == "U" {
            return None;
        }
        let minv: i64 = min.parse().ok()?;
        let maxv: u64 = if max == "U" { u64::MAX } else { max.parse().ok()? };
        if minv < -65504 || (minv < 0 && (max == "U" || maxv > 65504)) {
            return None;
        }
        let stype = if minv < 0 || (max != "U" && maxv <= 1000) {
            StoreType::F16
        } else {
            StoreType::AUint
        };
        vals.push(TypesdbVal { name: name.to_string(), vtype, stype });
    }
    if vals.is_empty() { None } else { Some((key.to_string(), vals)) }
}

fn parse_string(data: &[u8]) -> String {
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    String::from_utf8_lossy(data).into_owned()
}

fn parse_int(data: &[u8]) -> io::Result<u64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| io::Error::other(format!("invalid integer part length {}", data.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn parse_values(data: &[u8]) -> io::Result<Vec<f64>> {
    if data.len() < 2 {
        return Err(io::Error::other("values part missing count"));
    }
    let num = u16::from_be_bytes([data[0], data[1]]) as usize;
    let data = &data[2..];
    if data.len() != num * 9 {
        return Err(io::Error::other(format!(
            "values part length mismatch ({num}:{})",
            data.len()
        )));
    }
    let mut values = Vec::with_capacity(num);
    for i in 0..num {
        let raw: [u8; 8] = data[num + i * 8..num + i * 8 + 8].try_into().unwrap();
        let v = match data[i] {
            VAL_COUNTER | VAL_ABSOLUTE => u64::from_be_bytes(raw) as f64,
            VAL_GAUGE => f64::from_le_bytes(raw),
            VAL_DERIVE => u64::from_be_bytes(raw) as i64 as f64,
            t => return Err(io::Error::other(format!("unsupported value type {t}"))),
        };
        values.push(v);
    }
    Ok(values)
}

/// Binds the UDP socket and spawns the receive loop. Every datagram is
/// copied into a write task; the socket is polled so the loop notices a
/// shutdown within its timeout.
pub fn spawn(
    receiver: Arc<CollectdReceiver>,
    port: u16,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    info!(port, "collectd receiver listening");
    thread::Builder::new().name("ringmon-collectd".into()).spawn(move || {
        let mut buf = [0u8; 1452];
        while running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((size, peer)) => {
                    debug!(%peer, size, "got packet");
                    let payload = buf[..size].to_vec();
                    let rx = receiver.clone();
                    queue.put(Task::Write(WriteTask {
                        payload,
                        parse: Box::new(move |data, registry| rx.parse(data, registry)),
                    }));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "recv failed");
                    break;
                }
            }
        }
        debug!("collectd receiver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn part_str(ptype: u16, s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ptype.to_be_bytes());
        out.extend_from_slice(&((4 + s.len() + 1) as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        out.push(0);
        out
    }

    fn part_int(ptype: u16, v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ptype.to_be_bytes());
        out.extend_from_slice(&12u16.to_be_bytes());
        out.extend_from_slice(&v.to_be_bytes());
        out
    }

    fn part_gauges(values: &[f64]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PART_VALUES.to_be_bytes());
        out.extend_from_slice(&((4 + 2 + values.len() * 9) as u16).to_be_bytes());
        out.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for _ in values {
            out.push(VAL_GAUGE);
        }
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn test_receiver(types: &str) -> CollectdReceiver {
        let dir = tempdir().unwrap();
        let path = dir.path().join("types.db");
        fs::write(&path, types).unwrap();
        CollectdReceiver::from_types_db(&path).unwrap()
    }

    #[test]
    fn types_db_lines_parse() {
        let rx = test_receiver(
            "# comment\n\
             load  shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000\n\
             percent  value:GAUGE:0:100.1\n\
             if_octets  rx:DERIVE:0:U, tx:DERIVE:0:U\n\
             bogus  value:NOPE:0:1\n",
        );
        assert_eq!(rx.typesdb.len(), 2); // percent fails on the float max
        assert_eq!(rx.typesdb["load"].len(), 3);
        assert_eq!(rx.typesdb["if_octets"][0].vtype, ValType::Derive);
        assert_eq!(rx.typesdb["if_octets"][0].stype, StoreType::AUint);
    }

    #[test]
    fn store_type_follows_declared_range() {
        let rx = test_receiver(
            "small  value:GAUGE:0:100\n\
             signed  value:GAUGE:-100:100\n\
             wide  value:GAUGE:0:U\n",
        );
        assert_eq!(rx.typesdb["small"][0].stype, StoreType::F16);
        assert_eq!(rx.typesdb["signed"][0].stype, StoreType::F16);
        assert_eq!(rx.typesdb["wide"][0].stype, StoreType::AUint);
    }

    #[test]
    fn gauge_packet_lands_in_the_registry() {
        let rx = test_receiver("load  value:GAUGE:0:5000\n");
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let mut packet = Vec::new();
        packet.extend(part_str(PART_HOST, "web1"));
        packet.extend(part_int(PART_TIME_HR, 1_000_000_000u64 << 30));
        packet.extend(part_str(PART_PLUGIN, "load"));
        packet.extend(part_str(PART_TYPE, "load"));
        packet.extend(part_gauges(&[0.75]));
        rx.parse(&packet, &mut registry).unwrap();
        let log = registry.resolve("web1.load.load").unwrap();
        assert_eq!(log.levels()[0].time, 1_000_000_000);
        let mut out = vec![0.0f32; 1];
        log.range(1_000_000_000, 1_000_000_005, 5, &mut out).unwrap();
        assert!((out[0] - 0.75).abs() < 1e-3);
    }

    #[test]
    fn cpu_idle_is_rewritten_to_usage() {
        let rx = test_receiver("percent  value:GAUGE:0:100\n");
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let mut packet = Vec::new();
        packet.extend(part_str(PART_HOST, "web1"));
        packet.extend(part_int(PART_TIME, 1_000_000_000));
        packet.extend(part_str(PART_PLUGIN, "cpu"));
        packet.extend(part_str(PART_TYPE, "percent"));
        packet.extend(part_str(PART_TYPE_INSTANCE, "idle"));
        packet.extend(part_gauges(&[92.0]));
        rx.parse(&packet, &mut registry).unwrap();
        let log = registry.resolve("web1.cpu.percent.usage").unwrap();
        let mut out = vec![0.0f32; 1];
        log.range(1_000_000_000, 1_000_000_005, 5, &mut out).unwrap();
        assert!((out[0] - 8.0).abs() < 1e-2);
    }

    #[test]
    fn unlisted_metrics_are_dropped() {
        let rx = test_receiver("gauge  value:GAUGE:0:100\n");
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let mut packet = Vec::new();
        packet.extend(part_str(PART_HOST, "web1"));
        packet.extend(part_int(PART_TIME, 1_000_000_000));
        packet.extend(part_str(PART_PLUGIN, "entropy"));
        packet.extend(part_str(PART_TYPE, "gauge"));
        packet.extend(part_gauges(&[42.0]));
        rx.parse(&packet, &mut registry).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn load_keeps_only_the_first_value() {
        let rx = test_receiver(
            "load  shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000\n",
        );
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let mut packet = Vec::new();
        packet.extend(part_str(PART_HOST, "web1"));
        packet.extend(part_int(PART_TIME, 1_000_000_000));
        packet.extend(part_str(PART_PLUGIN, "load"));
        packet.extend(part_str(PART_TYPE, "load"));
        packet.extend(part_gauges(&[1.5, 1.2, 1.0]));
        rx.parse(&packet, &mut registry).unwrap();
        // a single value means no per-value name suffix
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("web1.load.load").is_some());
    }

    #[test]
    fn derive_pairs_become_interval_averages() {
        let rx = test_receiver("if_octets  rx:DERIVE:0:U, tx:DERIVE:0:U\n");
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let t0 = 1_000_000_000u32;
        for (t, v) in [(t0, 1000u64), (t0 + 10, 1500)] {
            let mut packet = Vec::new();
            packet.extend(part_str(PART_HOST, "web1"));
            packet.extend(part_int(PART_TIME, t as u64));
            packet.extend(part_str(PART_PLUGIN, "interface"));
            packet.extend(part_str(PART_PLUGIN_INSTANCE, "eth0"));
            packet.extend(part_str(PART_TYPE, "if_octets"));
            {
                let mut part = Vec::new();
                part.extend_from_slice(&PART_VALUES.to_be_bytes());
                part.extend_from_slice(&(4 + 2 + 2 * 9u16).to_be_bytes());
                part.extend_from_slice(&2u16.to_be_bytes());
                part.push(VAL_DERIVE);
                part.push(VAL_DERIVE);
                part.extend_from_slice(&v.to_be_bytes());
                part.extend_from_slice(&(v * 2).to_be_bytes());
                packet.extend(part);
            }
            rx.parse(&packet, &mut registry).unwrap();
        }
        // 500 octets over 10 s -> 50/s in both interval buckets
        let log = registry.resolve("web1.interface.eth0.if_octets.rx").unwrap();
        let mut out = vec![0.0f32; 2];
        log.range(t0 + 5, t0 + 15, 5, &mut out).unwrap();
        assert!((out[0] - 50.0).abs() < 0.5);
        assert!((out[1] - 50.0).abs() < 0.5);
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let rx = test_receiver("load  value:GAUGE:0:5000\n");
        let dir = tempdir().unwrap();
        let mut registry = Registry::new(dir.path());
        let mut packet = part_str(PART_HOST, "web1");
        packet.extend_from_slice(&PART_VALUES.to_be_bytes());
        packet.extend_from_slice(&100u16.to_be_bytes()); // claims more than present
        assert!(rx.parse(&packet, &mut registry).is_err());
    }
}
