//! Query side of the series log: range planning, gap-aware point ranges
//! and value-time integrals over caller-supplied boundaries.

use std::io;

use crate::storage::level::{gcd, min_time, round_up};
use crate::storage::series::{DEFAULT_PERIODS, DEFAULT_STEPS, SeriesLog};

/// An aligned query window produced by [`range_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeParams {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl RangeParams {
    pub fn is_empty(&self) -> bool {
        self.step == 0 || self.start >= self.end
    }

    /// Number of output buckets.
    pub fn points(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            ((self.end - self.start) / self.step) as usize
        }
    }
}

/// Fits a requested `[start, end]` window to at most `len` buckets: picks
/// the finest default level that still spans back to `start` from `cur`,
/// derives the step from it, and aligns both ends up to the step.
pub fn range_params(start: u32, end: u32, cur: u32, len: u32) -> RangeParams {
    let end = end.min(cur);
    if start >= end {
        return RangeParams { start: 0, end: 0, step: 0 };
    }
    let level = (0..DEFAULT_STEPS.len() - 1)
        .find(|&i| cur - start <= DEFAULT_PERIODS[i])
        .unwrap_or(DEFAULT_STEPS.len() - 1);
    let step = round_up((end - start) / len, DEFAULT_STEPS[level]);
    let start = round_up(start, step);
    let end = (start + step).max(round_up(end, step));
    RangeParams { start, end, step }
}

impl SeriesLog {
    /// Fills `out` with `(end - start) / step` samples at times `start`,
    /// `start + step`, … Both bounds must be step-aligned.
    ///
    /// The coarsest level whose history reaches `start` and whose step
    /// divides `step` is preferred (exact downsampling); otherwise the best
    /// approximation is used. Finer data is averaged per output bucket,
    /// coarser data is replicated, and times outside the stored data come
    /// back as NaN.
    pub fn range(&self, start: u32, end: u32, step: u32, out: &mut [f32]) -> io::Result<()> {
        if start >= end || step == 0 || start % step != 0 || end % step != 0 {
            return Err(io::Error::other("range parameters misaligned"));
        }
        debug_assert_eq!(out.len(), ((end - start) / step) as usize);
        let nlv = self.lv.len();

        let mut level = nlv;
        for l in (0..nlv).rev() {
            if self.lv[l].time > 0 && self.lv[l].min_time() <= start && step % self.lv[l].step == 0 {
                level = l;
                break;
            }
        }
        if level == nlv {
            // no exact match: first level whose history still covers `start`
            level = (0..nlv - 1)
                .find(|&l| self.lv[l].time == 0 || self.lv[l].min_time() <= start)
                .unwrap_or(nlv - 1);
            if level > 0 && self.lv[level].time == 0 {
                // nothing reaches that far back: use the level with most data
                level -= 1;
            } else if self.lv[level].time == 0 {
                // no data at all, fall through and emit NaN
            } else if self.lv[level].step < step {
                // among finer levels pick the one sharing the most step structure
                let mut higcd = gcd(self.lv[level].step, step);
                let mut l = level + 1;
                while l < nlv && self.lv[l].step < step {
                    let g = gcd(self.lv[l].step, step);
                    if g >= higcd {
                        level = l;
                        higcd = g;
                    }
                    l += 1;
                }
            }
        }

        let mut idx = 0usize;
        let mut start = start;
        let mut lvtime = self.lv[level].min_time();
        if lvtime == 0 {
            for slot in out.iter_mut() {
                *slot = f32::NAN;
            }
            return Ok(());
        }

        // before the earliest stored bucket
        while start < lvtime && start < end {
            out[idx] = f32::NAN;
            idx += 1;
            start += step;
        }

        // within the chosen level
        let lstep = self.lv[level].step;
        let mut lvpos = 0u32;
        if lvtime > 0 && lvtime < end && start < end {
            // smallest bucket time > (start - step), >= lvtime, on the level grid
            let mut startstep = start - start % lstep;
            while startstep >= lvtime + lstep && start - (startstep - lstep) < step {
                startstep -= lstep;
            }
            debug_assert!(lvtime <= startstep && startstep <= self.lv[level].time);
            lvtime = startstep;
            lvpos = self.lv[level].time_pos(lvtime).unwrap_or(0);
        }
        if lstep <= step {
            while start <= self.lv[level].time && start < end {
                let mut sum = 0.0f32;
                let mut cnt = 0u32;
                while lvtime <= start {
                    let v = self.bucket(level, lvpos as usize);
                    if !v.is_nan() {
                        sum += v;
                        cnt += 1;
                    }
                    lvtime += lstep;
                    lvpos = (lvpos + 1) % self.lv[level].len;
                }
                out[idx] = if cnt > 0 { sum / cnt as f32 } else { f32::NAN };
                idx += 1;
                start += step;
            }
        } else {
            while lvtime <= self.lv[level].time && lvtime < end {
                let v = self.bucket(level, lvpos as usize);
                while start <= lvtime && start < end {
                    out[idx] = v;
                    idx += 1;
                    start += step;
                }
                lvtime += lstep;
                lvpos = (lvpos + 1) % self.lv[level].len;
            }
        }

        // newer than the chosen level goes on in level 0
        let step0 = self.lv[0].step;
        let mut lvtime = self.lv[0].min_time();
        if level != 0 && start <= self.lv[0].time && lvtime < end {
            debug_assert!(lvtime <= start && lvtime > 0);
            lvtime = start - start % step0;
            let mut lvpos = self.lv[0].time_pos(lvtime).unwrap_or(0);
            if step0 <= step {
                while start <= self.lv[0].time && start < end {
                    let mut sum = 0.0f32;
                    let mut cnt = 0u32;
                    while lvtime <= start {
                        let v = self.value0[lvpos as usize];
                        if !v.is_nan() {
                            sum += v;
                            cnt += 1;
                        }
                        lvtime += step0;
                        lvpos = (lvpos + 1) % self.lv[0].len;
                    }
                    out[idx] = if cnt > 0 { sum / cnt as f32 } else { f32::NAN };
                    idx += 1;
                    start += step;
                }
            } else {
                while lvtime <= self.lv[0].time && lvtime < end {
                    let v = self.value0[lvpos as usize];
                    while start <= lvtime && start < end {
                        out[idx] = v;
                        idx += 1;
                        start += step;
                    }
                    lvtime += step0;
                    lvpos = (lvpos + 1) % self.lv[0].len;
                }
            }
        }

        // beyond the newest data
        while start < end {
            out[idx] = f32::NAN;
            idx += 1;
            start += step;
        }
        Ok(())
    }

    /// Sums value × covered-seconds for each `[ranges[i-1], ranges[i])`
    /// window into `out` (which must hold `ranges.len() - 1` zeroed slots).
    /// NaN buckets contribute nothing; windows with no data stay 0.
    ///
    /// Walks the coarsest level whose step fits within one window and whose
    /// history reaches the first boundary, then continues in level 0 where
    /// it extends further.
    pub fn aggregate(&self, ranges: &[u32], out: &mut [f32]) {
        if ranges.len() < 2 || self.lv[0].time == 0 {
            return;
        }
        debug_assert_eq!(out.len(), ranges.len() - 1);
        let nlv = self.lv.len();
        let width = ranges[1] - ranges[0];
        let mut level = (0..nlv)
            .rev()
            .find(|&l| self.lv[l].step <= width && self.lv[l].time > 0)
            .unwrap_or(0);
        while level < nlv - 1 && self.lv[level].time > 0 && self.lv[level].min_time() > ranges[0] {
            level += 1;
        }
        if self.lv[level].time == 0 {
            level -= 1;
        }

        let lstep = self.lv[level].step;
        let lvmax = self.lv[level].time;
        let mut ridx = 1usize;
        let mut lvend = self.lv[level].min_time();
        if lvend == 0 {
            return;
        }
        let mut lvbegin = lvend - lstep;
        let mut lvpos = self.lv[level].time_pos(lvend).unwrap_or(0) as usize;
        debug_assert!(lvend > lvbegin);

        // windows entirely before the stored data
        while ridx < ranges.len() && ranges[ridx] <= lvbegin {
            out[ridx - 1] = 0.0;
            ridx += 1;
        }
        // skip to the first bucket overlapping the current window
        while lvend <= ranges[ridx - 1] && lvend <= lvmax {
            lvbegin = lvend;
            lvend += lstep;
            lvpos = if (lvpos as u32) < self.lv[level].len - 1 { lvpos + 1 } else { 0 };
        }

        let mut rangeval = 0.0f32;
        while ridx < ranges.len() && lvend <= lvmax {
            let rgbegin = ranges[ridx - 1];
            let rgend = ranges[ridx];
            loop {
                debug_assert!(lvbegin < rgend && rgbegin < lvend);
                let covertime = lvend.min(rgend) - lvbegin.max(rgbegin);
                let stepval = self.bucket(level, lvpos);
                if !stepval.is_nan() {
                    rangeval += stepval * covertime as f32;
                }
                if lvend <= rgend {
                    // window swallows the bucket: step to the next bucket
                    lvbegin = lvend;
                    lvend += lstep;
                    lvpos = if (lvpos as u32) < self.lv[level].len - 1 { lvpos + 1 } else { 0 };
                    if lvend > lvmax || lvbegin >= rgend {
                        break;
                    }
                } else {
                    break;
                }
            }
            if (lvend <= lvmax && lvend >= rgend) || (lvend > lvmax && lvbegin >= rgend) {
                // window finished
                out[ridx - 1] = rangeval;
                rangeval = 0.0;
                ridx += 1;
            } else {
                // data ran out mid-window
                debug_assert!(lvend > lvmax);
                break;
            }
        }

        // the chosen level is exhausted, keep walking in level 0
        let step0 = self.lv[0].step;
        if level != 0
            && ridx < ranges.len()
            && lvend > lvmax
            && lvbegin + step0 <= self.lv[0].time
            && lvbegin + step0 >= self.lv[0].min_time()
        {
            lvend = lvbegin + step0;
            let mut lvpos = self.lv[0].time_pos(lvend).unwrap_or(0) as usize;
            while ridx < ranges.len() && lvend <= self.lv[0].time {
                let rgend = ranges[ridx];
                while lvend <= rgend && lvend <= self.lv[0].time {
                    let v = self.value0[lvpos];
                    if !v.is_nan() {
                        rangeval += v * step0 as f32;
                    }
                    lvbegin = lvend;
                    lvend += step0;
                    lvpos = if (lvpos as u32) < self.lv[0].len - 1 { lvpos + 1 } else { 0 };
                }
                out[ridx - 1] = rangeval;
                rangeval = 0.0;
                ridx += 1;
            }
        }

        debug_assert!(!rangeval.is_nan());
        if rangeval > 0.0 && ridx < ranges.len() {
            // partial tail window
            out[ridx - 1] = rangeval;
            ridx += 1;
        }
        // anything left has no data
        while ridx < ranges.len() {
            out[ridx - 1] = 0.0;
            ridx += 1;
        }
    }

    /// Every stored bucket of `level` in time order, for inspection tools.
    /// Buckets older than what the terminal level can map back are skipped.
    pub fn level_buckets(&self, level: usize) -> Vec<(u32, f32)> {
        let l = self.lv[level];
        if l.time == 0 {
            return Vec::new();
        }
        let mut dtime = l.min_time();
        let last = &self.lv[self.lv.len() - 1];
        let mut allmin = min_time(last.time, last.pos, last.step);
        let span = last.step - self.lv[0].step;
        if allmin > span {
            allmin -= span;
        } else {
            allmin = self.lv[0].step;
        }
        if dtime < allmin && dtime != 0 {
            dtime = round_up(allmin, l.step);
        }
        let mut out = Vec::new();
        if dtime == 0 || dtime > l.time {
            return out;
        }
        let mut pos = (l.pos as i64 - 1 - ((l.time - dtime) / l.step) as i64).rem_euclid(l.len as i64);
        while dtime <= l.time {
            if pos >= l.len as i64 {
                pos = 0;
            }
            out.push((dtime, self.bucket(level, pos as usize)));
            dtime += l.step;
            pos += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StoreType;
    use tempfile::tempdir;

    fn f16_of(v: f64) -> f32 {
        StoreType::F16.decode(StoreType::F16.encode(v)) as f32
    }

    #[test]
    fn range_params_align_to_step() {
        let p = range_params(1000, 1015, 2000, 600);
        assert_eq!(p, RangeParams { start: 1000, end: 1015, step: 5 });
        assert_eq!(p.points(), 3);
        // a wide window coarsens the step and keeps both ends aligned
        let p = range_params(3, 40_000, 40_000, 600);
        assert_eq!(p.step % 5, 0);
        assert_eq!(p.start % p.step, 0);
        assert_eq!(p.end % p.step, 0);
        assert!(p.points() <= 600);
    }

    #[test]
    fn range_params_clamp_to_current_time() {
        let p = range_params(1000, 5000, 1500, 600);
        assert_eq!(p.end, 1500);
        // fully in the future: nothing to return
        assert!(range_params(2000, 3000, 1500, 600).is_empty());
    }

    #[test]
    fn range_params_pick_coarser_levels_for_old_starts() {
        let cur = 100_000_000;
        // 10 days back: level 1 (60 s) is the finest that covers it
        let p = range_params(cur - 10 * 86400, cur, cur, 600);
        assert_eq!(p.step % 60, 0);
        // 100 days back: level 2 (600 s)
        let p = range_params(cur - 100 * 86400, cur, cur, 600);
        assert_eq!(p.step % 600, 0);
    }

    fn series_with(dir: &std::path::Path, samples: &[(u32, f64)]) -> SeriesLog {
        let mut log = SeriesLog::open(dir, "a", Some(StoreType::F16)).unwrap();
        for &(t, v) in samples {
            log.append(t, v).unwrap();
        }
        log
    }

    #[test]
    fn range_returns_exact_level0_samples() {
        let dir = tempdir().unwrap();
        let log = series_with(dir.path(), &[(1000, 10.0), (1005, 20.0), (1010, 30.0)]);
        let mut out = vec![0.0f32; 3];
        log.range(1000, 1015, 5, &mut out).unwrap();
        assert_eq!(out, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn range_rejects_misaligned_params() {
        let dir = tempdir().unwrap();
        let log = series_with(dir.path(), &[(1000, 10.0)]);
        let mut out = vec![0.0f32; 1];
        assert!(log.range(1001, 1006, 5, &mut out).is_err());
        assert!(log.range(1000, 1000, 5, &mut out).is_err());
        assert!(log.range(1000, 1005, 0, &mut out).is_err());
    }

    #[test]
    fn range_marks_gaps_and_future_as_nan() {
        let dir = tempdir().unwrap();
        let log = series_with(dir.path(), &[(100, 1.0), (200, 2.0)]);
        let mut out = vec![0.0f32; 30];
        log.range(70, 220, 5, &mut out).unwrap();
        // before the first sample
        for slot in &out[0..6] {
            assert!(slot.is_nan());
        }
        assert_eq!(out[6], 1.0);
        for slot in &out[7..26] {
            assert!(slot.is_nan());
        }
        assert_eq!(out[26], 2.0);
        // past the newest bucket
        for slot in &out[27..] {
            assert!(slot.is_nan());
        }
    }

    #[test]
    fn range_downsamples_by_mean() {
        let dir = tempdir().unwrap();
        // 1, 2, 3, 4 at 5 s; 10 s buckets average pairs
        let log = series_with(dir.path(), &[(1005, 1.0), (1010, 2.0), (1015, 3.0), (1020, 4.0)]);
        let mut out = vec![0.0f32; 2];
        log.range(1010, 1030, 10, &mut out).unwrap();
        assert_eq!(out[0], 1.5);
        assert_eq!(out[1], 3.5);
    }

    #[test]
    fn range_upsamples_by_replication() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        // write 1.2 days so the level-0 ring no longer reaches the start of
        // the query; a 30 s step forces nearest-neighbour upsampling from
        // the minute level
        let t0 = 1_000_000_200u32; // multiple of 600
        for k in 0..20736u32 {
            log.append(t0 + 5 * k, 6.0).unwrap();
        }
        assert!(log.levels()[0].min_time() > t0 + 210);
        let mut out = vec![0.0f32; 5];
        log.range(t0 + 60, t0 + 210, 30, &mut out).unwrap();
        assert_eq!(out, vec![6.0, 6.0, 6.0, 6.0, 6.0]);
    }

    #[test]
    fn range_continues_past_coarse_level_in_level0() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let t0 = 1_000_000_200u32;
        for k in 0..37u32 {
            // 0, 5, .. 180 seconds: minute roll-up seals buckets t0+60 and t0+120
            log.append(t0 + 5 * k, 7.0).unwrap();
        }
        assert_eq!(log.levels()[1].time, t0 + 120);
        let mut out = vec![0.0f32; 3];
        log.range(t0 + 60, t0 + 240, 60, &mut out).unwrap();
        // the first two slots come from minute buckets; the third is newer
        // than the minute level and falls through to level 0
        assert_eq!(out, vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn range_on_empty_series_is_all_nan() {
        let dir = tempdir().unwrap();
        let log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let mut out = vec![0.0f32; 4];
        log.range(1000, 1020, 5, &mut out).unwrap();
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ring_wrap_drops_the_oldest_bucket() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let len = log.levels()[0].len; // 17280 buckets of 5 s
        let t0 = 1_000_000_000u32;
        for k in 0..=len {
            log.append(t0 + 5 * k, k as f64).unwrap();
        }
        assert_eq!(log.levels()[0].min_time(), t0 + 5);
        let mut out = vec![0.0f32; len as usize];
        log.range(t0 + 5, t0 + 5 + 5 * len, 5, &mut out).unwrap();
        assert_eq!(out[0], 1.0);
        assert_eq!(out[len as usize - 1], len as f32);
        // the very first sample is no longer addressable
        assert_eq!(log.levels()[0].time_pos(t0), None);
    }

    #[test]
    fn aggregate_sums_value_seconds() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let t0 = 1_000_000_200u32;
        // 2.0 for 15 minutes of 5 s buckets, with slack past the last boundary
        for k in 1..=180u32 {
            log.append(t0 + 5 * k, 2.0).unwrap();
        }
        let ranges = vec![t0, t0 + 300, t0 + 600];
        let mut out = vec![0.0f32; 2];
        log.aggregate(&ranges, &mut out);
        assert_eq!(out[0], 600.0); // 2.0 × 300 s
        assert_eq!(out[1], 600.0);
    }

    #[test]
    fn aggregate_ignores_nan_and_zero_fills_missing() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let t0 = 1_000_000_200u32;
        // data only inside the second window, clear of its minute boundary
        for k in 0..60u32 {
            log.append(t0 + 305 + 5 * k, 1.0).unwrap();
        }
        let ranges = vec![t0, t0 + 300, t0 + 600, t0 + 900];
        let mut out = vec![0.0f32; 3];
        log.aggregate(&ranges, &mut out);
        assert_eq!(out[0], 0.0);
        // 60 samples × 1.0 × 5 s, partly served by the level-0 walk
        assert_eq!(out[1], 300.0);
        // nothing was ever written after t0 + 605
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn aggregate_empty_series_leaves_zeroes() {
        let dir = tempdir().unwrap();
        let log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        let mut out = vec![0.0f32; 2];
        log.aggregate(&[100, 200, 300], &mut out);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn month_aggregation_matches_calendar_lengths() {
        let dir = tempdir().unwrap();
        let mut log = SeriesLog::open(dir.path(), "a", Some(StoreType::F16)).unwrap();
        const JAN: u32 = 1_704_038_400; // 2024-01-01 00:00 UTC+8
        const MAR: u32 = JAN + (31 + 29) * 86400;
        // 1.0 every 5 s for two months, plus slack so the half-hour level
        // seals its bucket ending exactly on the March boundary
        let mut t = JAN;
        while t <= MAR + 70 {
            log.append(t, 1.0).unwrap();
            t += 5;
        }
        let (aggr, bounds) =
            crate::calendar::boundaries(crate::calendar::Aggr::Month, JAN, MAR);
        assert_eq!(aggr, crate::calendar::Aggr::Month);
        assert_eq!(bounds, vec![JAN, JAN + 31 * 86400, MAR]);
        let mut out = vec![0.0f32; 2];
        log.aggregate(&bounds, &mut out);
        // value × seconds per calendar month; February 2024 is leap
        assert_eq!(out[0], (31 * 86400) as f32);
        assert_eq!(out[1], (29 * 86400) as f32);

        // the integrals survive a flush and reopen
        log.flush(true).unwrap();
        let again = SeriesLog::open(dir.path(), "a", None).unwrap();
        let mut out2 = vec![0.0f32; 2];
        again.aggregate(&bounds, &mut out2);
        assert_eq!(out, out2);
    }

    #[test]
    fn level_buckets_walk_in_time_order() {
        let dir = tempdir().unwrap();
        let log = series_with(dir.path(), &[(1000, 1.0), (1005, 2.0), (1010, 3.0)]);
        let buckets = log.level_buckets(0);
        let tail: Vec<_> = buckets.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, vec![(1000, 1.0), (1005, 2.0), (1010, 3.0)]);
    }
}
