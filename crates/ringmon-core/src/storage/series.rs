//! The per-series storage engine.
//!
//! One series owns one file holding all resolution levels back to back:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ HEADER (8 bytes, little-endian)                      │
//! │   store_type: i32      (0 = AU, 1 = F16)             │
//! │   lvnum: i32           (2..=20)                      │
//! ├──────────────────────────────────────────────────────┤
//! │ LEVEL TABLE (lvnum × 20 bytes)                       │
//! │   Per level:                                         │
//! │     step: i32   (seconds per bucket)                 │
//! │     off: i32    (byte offset of the value array)     │
//! │     len: i32    (buckets)                            │
//! │     time: u32   (bucket time of last write)          │
//! │     pos: i32    (next write index, modulo len)       │
//! ├──────────────────────────────────────────────────────┤
//! │ LEVEL 0 VALUES  f32[len0]   (raw samples)            │
//! │ LEVEL i VALUES  u16[leni]   (codec codewords)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Level 0 holds raw samples at the finest step; every coarser level holds
//! the arithmetic mean of the level-0 buckets in its window. All levels but
//! the last rotate in place; the last keeps full history and grows the file
//! tail when it fills up. Writes are buffered in memory and flushed in
//! batches (see [`SeriesLog::flush`]).

use std::fs;
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::codec::StoreType;
use crate::storage::level::{LevelInfo, round_time, round_up};
use crate::util::unix_now;

/// The finest bucket width. Every other level step is a multiple of it.
pub const MIN_STEP: u32 = 5;

/// Default level layout for newly created series.
pub(crate) const DEFAULT_STEPS: [u32; 4] = [5, 60, 600, 1800];
pub(crate) const DEFAULT_PERIODS: [u32; 4] = [86400, 15 * 86400, 183 * 86400, 365 * 86400];

/// Grace period after a coarse bucket's end before it is sealed, so late
/// samples still land in it.
pub(crate) const UPDELAY: u32 = 60;

// deferred flush thresholds: data seconds and wall-clock seconds
const MIN_WRITE_STEP: u32 = 600;
const MIN_WRITE_TIME: u32 = 120;

const HEADER_SIZE: usize = 8;
const LEVEL_INFO_SIZE: usize = 20;

pub struct SeriesLog {
    name: String,
    path: PathBuf,
    stype: StoreType,
    pub(crate) lv: Vec<LevelInfo>,
    /// Level-0 raw samples.
    pub(crate) value0: Vec<f32>,
    /// Codeword arrays for levels 1.., index 0 unused.
    pub(crate) values: Vec<Vec<u16>>,
    /// Buckets written in memory but not yet on disk, per level.
    pending: Vec<u32>,
    /// Whether any level >= 1 has pending buckets.
    is_pending: bool,
    /// Smallest sample time ever seen, `u32::MAX` until the first sample.
    firsttime: u32,
    /// Wall-clock time of the last flush.
    writetime: u32,
    /// Level-0 bucket time at the last flush.
    writestep: u32,
}

impl SeriesLog {
    /// Opens the series file under `dir`, or creates it when `stype` is
    /// given. With `stype == None` a missing file is an error and an
    /// existing file's own store type is adopted.
    pub fn open(dir: &Path, name: &str, stype: Option<StoreType>) -> io::Result<SeriesLog> {
        let path = dir.join(name);
        match fs::read(&path) {
            Ok(data) => Self::load(name, path, &data, stype),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(stype) = stype else {
                    return Err(io::Error::other(format!("no data file for series {name}")));
                };
                Self::create(name, path, stype)
            }
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_type(&self) -> StoreType {
        self.stype
    }

    pub fn levels(&self) -> &[LevelInfo] {
        &self.lv
    }

    /// Decoded value of one bucket.
    pub(crate) fn bucket(&self, level: usize, pos: usize) -> f32 {
        if level == 0 {
            self.value0[pos]
        } else {
            self.stype.decode(self.values[level][pos]) as f32
        }
    }

    fn load(name: &str, path: PathBuf, data: &[u8], want: Option<StoreType>) -> io::Result<SeriesLog> {
        let corrupt = |what: &str| {
            io::Error::other(format!("data file corrupted ({what}) {}", path.display()))
        };
        if data.len() < HEADER_SIZE {
            return Err(corrupt("short header"));
        }
        let tag = i32::from_le_bytes(data[0..4].try_into().unwrap());
        let lvnum = i32::from_le_bytes(data[4..8].try_into().unwrap());
        let stype = match (StoreType::from_tag(tag), want) {
            (Some(t), None) => t,
            (Some(t), Some(w)) if t == w => t,
            (Some(t), Some(w)) => {
                return Err(io::Error::other(format!(
                    "store type mismatch {}:{} {}",
                    w.tag(),
                    t.tag(),
                    path.display()
                )));
            }
            (None, _) => {
                return Err(io::Error::other(format!(
                    "invalid store type {tag} {}",
                    path.display()
                )));
            }
        };
        if !(2..=20).contains(&lvnum) {
            return Err(io::Error::other(format!(
                "invalid level count {lvnum} {}",
                path.display()
            )));
        }
        let lvnum = lvnum as usize;
        if data.len() < HEADER_SIZE + lvnum * LEVEL_INFO_SIZE {
            return Err(corrupt("short level table"));
        }

        let mut lv = Vec::with_capacity(lvnum);
        for i in 0..lvnum {
            let base = HEADER_SIZE + i * LEVEL_INFO_SIZE;
            let field = |k: usize| -> i32 {
                i32::from_le_bytes(data[base + 4 * k..base + 4 * k + 4].try_into().unwrap())
            };
            let (step, off, len, pos) = (field(0), field(1), field(2), field(4));
            let time = u32::from_le_bytes(data[base + 12..base + 16].try_into().unwrap());
            if step <= 0 || len <= 0 || off < 0 || pos < 0 || pos > len {
                return Err(corrupt(&format!("level {i} bounds {step}:{off}:{len}:{pos}")));
            }
            lv.push(LevelInfo {
                step: step as u32,
                off: off as u32,
                len: len as u32,
                time,
                pos: pos as u32,
            });
        }

        if lv[0].step != MIN_STEP {
            return Err(io::Error::other(format!(
                "incompatible base step {} {}",
                lv[0].step,
                path.display()
            )));
        }
        let step0 = lv[0].step;
        let mut basepos = (HEADER_SIZE + lvnum * LEVEL_INFO_SIZE) as u64;
        for (i, l) in lv.iter_mut().enumerate() {
            if l.off as u64 != basepos {
                return Err(corrupt(&format!("level {i} offset {} != {basepos}", l.off)));
            }
            let period = l.period();
            let terminal = i == lvnum - 1;
            if (i == 0 && l.step > 86400)
                || l.step > 10 * 86400
                || (86400 % l.step != 0 && l.step % 86400 != 0)
                || (!terminal && l.len > 10 * 1024 * 1024)
                || (period % 86400 != 0 && 86400 % period != 0)
            {
                return Err(io::Error::other(format!(
                    "data file incompatible (level {i} step {} len {}) {}",
                    l.step,
                    l.len,
                    path.display()
                )));
            }
            if l.step % step0 != 0 {
                return Err(io::Error::other(format!(
                    "data file incompatible (level {i} step {}) {}",
                    l.step,
                    path.display()
                )));
            }
            l.time -= l.time % l.step;
            if l.time > 500_000_000 && !(1_577_808_000..=2_524_579_200).contains(&l.time) {
                return Err(corrupt(&format!("level {i} time {}", l.time)));
            }
            basepos += l.len as u64 * if i == 0 { 4 } else { 2 };
        }
        if (data.len() as u64) < basepos {
            return Err(corrupt(&format!("file size {} < {basepos}", data.len())));
        }

        let off0 = lv[0].off as usize;
        let len0 = lv[0].len as usize;
        let value0: Vec<f32> = data[off0..off0 + len0 * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let mut values = vec![Vec::new(); lvnum];
        for (i, slot) in values.iter_mut().enumerate().skip(1) {
            let off = lv[i].off as usize;
            let len = lv[i].len as usize;
            *slot = data[off..off + len * 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
                .collect();
        }

        info!(series = name, "loaded data file");
        let writestep = lv[0].time;
        Ok(SeriesLog {
            name: name.to_string(),
            path,
            stype,
            pending: vec![0; lvnum],
            is_pending: false,
            firsttime: u32::MAX,
            writetime: unix_now(),
            writestep,
            lv,
            value0,
            values,
        })
    }

    fn create(name: &str, path: PathBuf, stype: StoreType) -> io::Result<SeriesLog> {
        let lvnum = DEFAULT_STEPS.len();
        let mut lv = Vec::with_capacity(lvnum);
        let mut basepos = (HEADER_SIZE + lvnum * LEVEL_INFO_SIZE) as u32;
        for i in 0..lvnum {
            let step = DEFAULT_STEPS[i];
            let len = DEFAULT_PERIODS[i] / step;
            lv.push(LevelInfo { step, off: basepos, len, time: 0, pos: 0 });
            basepos += len * if i == 0 { 4 } else { 2 };
        }
        let value0 = vec![f32::NAN; lv[0].len as usize];
        let mut values = vec![Vec::new(); lvnum];
        for (i, slot) in values.iter_mut().enumerate().skip(1) {
            *slot = vec![stype.nan(); lv[i].len as usize];
        }
        let log = SeriesLog {
            name: name.to_string(),
            path,
            stype,
            pending: vec![0; lvnum],
            is_pending: false,
            firsttime: u32::MAX,
            writetime: unix_now(),
            writestep: 0,
            lv,
            value0,
            values,
        };
        log.write_full()?;
        info!(series = name, "initialized data file");
        Ok(log)
    }

    /// Writes the complete file image (header, table, all value arrays).
    fn write_full(&self) -> io::Result<()> {
        let total = self.lv.last().map(|l| l.off as usize).unwrap_or(0)
            + self.values.last().map(|v| v.len() * 2).unwrap_or(0);
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.stype.tag().to_le_bytes());
        buf.extend_from_slice(&(self.lv.len() as i32).to_le_bytes());
        buf.extend_from_slice(&self.encode_level_table());
        for v in &self.value0 {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for level in self.values.iter().skip(1) {
            for v in level {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        fs::write(&self.path, buf)
    }

    fn encode_level_table(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.lv.len() * LEVEL_INFO_SIZE);
        for l in &self.lv {
            buf.extend_from_slice(&(l.step as i32).to_le_bytes());
            buf.extend_from_slice(&(l.off as i32).to_le_bytes());
            buf.extend_from_slice(&(l.len as i32).to_le_bytes());
            buf.extend_from_slice(&l.time.to_le_bytes());
            buf.extend_from_slice(&(l.pos as i32).to_le_bytes());
        }
        buf
    }

    /// Appends a sample after checking the store type matches.
    pub fn append_typed(&mut self, time: u32, value: f64, stype: StoreType) -> io::Result<()> {
        if stype != self.stype {
            return Err(io::Error::other(format!(
                "store type mismatch {}:{} {}",
                stype.tag(),
                self.stype.tag(),
                self.name
            )));
        }
        self.append(time, value)
    }

    /// Records a sample at `time` (epoch seconds, snapped down to the base
    /// step). Samples older than the backfill window are dropped with a
    /// warning. Gaps since the previous sample are filled with NaN buckets,
    /// coarse levels are rolled up, and the file may be flushed.
    pub fn append(&mut self, time: u32, value: f64) -> io::Result<()> {
        let step0 = self.lv[0].step;
        let time = time - time % step0;
        let backfill = self.lv[0].period().min(60) as u32;
        if time == 0 || time + backfill <= self.lv[0].time {
            warn!(series = %self.name, time, "ignoring stale sample");
            return Ok(());
        }
        self.firsttime = self.firsttime.min(time);
        if self.writestep == 0 {
            self.writestep = time - step0;
        }

        // fill missing buckets with NaN
        let mut uptime = self.lv[0].time + step0;
        while self.lv[0].time != 0 && uptime < time {
            self.value0[self.lv[0].pos as usize] = f32::NAN;
            self.lv[0].pos += 1;
            self.pending[0] += 1;
            if self.lv[0].pos >= self.lv[0].len {
                self.lv[0].pos = 0;
            }
            self.lv[0].time = uptime;
            self.update_levels()?;
            uptime += step0;
        }

        // record the new value
        debug_assert!(self.lv[0].time == 0 || time <= self.lv[0].time + step0);
        let up_pos = if self.lv[0].time == 0 {
            0
        } else {
            ((self.lv[0].pos + self.lv[0].len
                - (self.lv[0].time + step0 - time) / step0)
                % self.lv[0].len) as usize
        };
        self.value0[up_pos] = value as f32;
        if time > self.lv[0].time {
            debug_assert_eq!(self.lv[0].pos as usize, up_pos);
            self.lv[0].pos += 1;
            self.pending[0] += 1;
            if self.lv[0].pos >= self.lv[0].len {
                self.lv[0].pos = 0;
            }
            self.lv[0].time = time;
            self.update_levels()?;
        } else if self.lv[0].time > 0 {
            // backfill into a covered bucket: widen the pending window so the
            // next flush rewrites it
            self.pending[0] = self.pending[0].max((self.lv[0].time - time) / step0);
        }

        if self.is_pending {
            self.flush(false)?;
        }
        Ok(())
    }

    fn update_levels(&mut self) -> io::Result<()> {
        for level in 1..self.lv.len() {
            self.update_level(level)?;
        }
        Ok(())
    }

    /// Seals every completed bucket of `level` whose end lies at least
    /// UPDELAY behind the newest level-0 data.
    fn update_level(&mut self, level: usize) -> io::Result<()> {
        let lstep = self.lv[level].step;
        debug_assert!(self.lv[level].time % lstep == 0);
        let mut last = round_time(self.lv[level].time, lstep);
        if last == 0 {
            last = round_time(self.firsttime, lstep) - lstep;
        }
        let datatime = self.lv[0].time;
        if datatime < last + lstep + UPDELAY {
            return Ok(());
        }
        let step0 = self.lv[0].step;
        let mintime0 = self.lv[0].min_time();
        let mut cur = last + lstep;
        while cur <= datatime - UPDELAY {
            // mean of the level-0 buckets in (cur - lstep, cur]
            let btime0 = (cur - lstep + step0).max(mintime0);
            let mut sum = 0.0f64;
            let mut cnt = 0u32;
            if let Some(start_pos) = self.lv[0].time_pos(btime0) {
                let mut pos0 = start_pos;
                let mut steptime = btime0;
                while steptime <= cur {
                    if pos0 >= self.lv[0].len {
                        pos0 = 0;
                    }
                    let v = self.value0[pos0 as usize];
                    if !v.is_nan() {
                        sum += v as f64;
                        cnt += 1;
                    }
                    steptime += step0;
                    pos0 += 1;
                }
            }
            let code = if cnt > 0 {
                self.stype.encode(sum / cnt as f64)
            } else {
                self.stype.nan()
            };
            self.values[level][self.lv[level].pos as usize] = code;
            self.lv[level].time = cur;
            self.lv[level].pos += 1;
            if self.lv[level].pos >= self.lv[level].len {
                if level != self.lv.len() - 1 {
                    self.lv[level].pos = 0;
                } else {
                    // the terminal level keeps all history: grow instead of wrap
                    self.expand_terminal(level)?;
                }
            }
            self.pending[level] += 1;
            self.is_pending = true;
            cur += lstep;
        }
        Ok(())
    }

    /// Grows the terminal level by a coarse chunk of NaN buckets and
    /// extends the file tail to match.
    fn expand_terminal(&mut self, level: usize) -> io::Result<()> {
        debug_assert_eq!(level, self.lv.len() - 1);
        let lstep = self.lv[level].step;
        let orilen = self.lv[level].len;
        let oriperiod = (self.lv[level].period() / 4) as u32;
        let expand = 86400.max((30 * 86400).min(round_up(oriperiod, 86400))) / lstep;
        debug_assert_eq!(self.values[level].len(), orilen as usize);
        self.values[level].resize((orilen + expand) as usize, self.stype.nan());
        let mut f = OpenOptions::new().write(true).open(&self.path).map_err(|e| {
            io::Error::other(format!("expand data file failed {}: {e}", self.path.display()))
        })?;
        f.seek(SeekFrom::Start(self.lv[level].off as u64 + 2 * orilen as u64))?;
        let mut buf = Vec::with_capacity(expand as usize * 2);
        for _ in 0..expand {
            buf.extend_from_slice(&self.stype.nan().to_le_bytes());
        }
        f.write_all(&buf)?;
        self.lv[level].len += expand;
        debug!(series = %self.name, buckets = expand, "expanded terminal level");
        Ok(())
    }

    /// Writes dirty state to disk. Unless `force`d, the write is skipped
    /// until enough data time (600 s) and wall time (120 s) have passed
    /// since the previous flush. Pending counters survive I/O failures so
    /// the next window retries the same buckets.
    pub fn flush(&mut self, force: bool) -> io::Result<()> {
        if force && !self.is_pending && self.pending[0] == 0 {
            return Ok(());
        }
        if !force && (!self.is_pending || self.lv[0].time < self.writestep + MIN_WRITE_STEP) {
            return Ok(());
        }
        if !force {
            let cur = unix_now();
            // the second clause resyncs after a wall-clock jump backwards
            if cur < self.writetime + MIN_WRITE_TIME && cur + MIN_WRITE_TIME > self.writetime {
                return Ok(());
            }
            debug!(series = %self.name, data_time = self.lv[0].time, "writing data file");
        }
        self.writetime = unix_now();
        self.writestep = self.lv[0].time;

        let mut f = OpenOptions::new().write(true).open(&self.path)?;
        f.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        f.write_all(&self.encode_level_table())?;
        for level in 0..self.lv.len() {
            if self.pending[level] == 0 {
                continue;
            }
            self.pending[level] = self.pending[level].min(self.lv[level].len);
            let pos = self.lv[level].pos;
            let from = pos.saturating_sub(self.pending[level]);
            self.write_region(&mut f, level, from, pos)?;
            if pos < self.pending[level] {
                // the pending window wraps around the ring seam
                let from = self.lv[level].len - (self.pending[level] - pos);
                self.write_region(&mut f, level, from, self.lv[level].len)?;
            }
            self.pending[level] = 0;
        }
        self.is_pending = false;
        Ok(())
    }

    fn write_region(&self, f: &mut fs::File, level: usize, from: u32, to: u32) -> io::Result<()> {
        if from >= to {
            return Ok(());
        }
        let isize = if level == 0 { 4u64 } else { 2u64 };
        f.seek(SeekFrom::Start(self.lv[level].off as u64 + isize * from as u64))?;
        let mut buf = Vec::with_capacity(((to - from) as u64 * isize) as usize);
        if level == 0 {
            for v in &self.value0[from as usize..to as usize] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        } else {
            for v in &self.values[level][from as usize..to as usize] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        f.write_all(&buf)
    }
}

impl Drop for SeriesLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush(true) {
            warn!(series = %self.name, error = %e, "final flush failed");
        }
    }
}
