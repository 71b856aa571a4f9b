//! GTID 集合
//!
//! GTID 集合是 源服务器 UUID → 有序、不重叠、相邻区间已合并的闭区间列表 的映射。
//! 支持解析 MySQL 文本格式、差集、交集、并集、包含判断、计数以及按升序迭代单个 GTID。
//!
//! 文本格式: `uuid:1-5:7,uuid2:3`。不带 UUID 的条目沿用前一个条目的 UUID
//! (`uuid:10-12,15`),空白与换行被忽略。

use mikurpl_common::{RplError, RplResult};
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 事务序号闭区间 `[start, end]`,`start >= 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start >= 1 && start <= end).then_some(Self { start, end })
    }

    pub fn single(number: u64) -> Option<Self> {
        Self::new(number, number)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// 区间内事务个数(区间永不为空)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 单个全局事务标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtid {
    pub uuid: Uuid,
    pub number: u64,
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.number)
    }
}

/// GTID 集合(不可变值类型)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Brief
    /// 解析 GTID 集合文本
    ///
    /// 空输入得到空集合。反向区间、序号 0、非法 UUID、同一输入内互相重叠的区间都会被拒绝。
    ///
    /// # Returns
    /// 成功返回规范化后的集合,失败返回 `GtidFormat` 错误
    pub fn parse(input: &str) -> RplResult<Self> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Ok(Self::new());
        }

        let mut raw: BTreeMap<Uuid, Vec<Interval>> = BTreeMap::new();
        let mut current: Option<Uuid> = None;

        for entry in compact.split(',') {
            if entry.is_empty() {
                return Err(RplError::gtid_format(input, "empty entry"));
            }
            let mut parts = entry.split(':').peekable();
            let first = parts.peek().copied().unwrap_or_default();

            if looks_like_uuid(first) {
                let uuid = Uuid::parse_str(first)
                    .map_err(|_| RplError::gtid_format(input, format!("invalid uuid '{}'", first)))?;
                parts.next();
                if parts.peek().is_none() {
                    return Err(RplError::gtid_format(
                        input,
                        format!("entry '{}' has no transaction interval", entry),
                    ));
                }
                current = Some(uuid);
            }

            let uuid = current.ok_or_else(|| {
                RplError::gtid_format(input, format!("entry '{}' does not start with a uuid", entry))
            })?;
            for part in parts {
                let interval = parse_interval(input, part)?;
                raw.entry(uuid).or_default().push(interval);
            }
        }

        let mut sets = BTreeMap::new();
        for (uuid, mut intervals) in raw {
            intervals.sort();
            for pair in intervals.windows(2) {
                if pair[1].start <= pair[0].end {
                    return Err(RplError::gtid_format(
                        input,
                        format!("interval {} overlaps {} for {}", pair[1], pair[0], uuid),
                    ));
                }
            }
            sets.insert(uuid, merge(intervals));
        }
        Ok(Self { sets })
    }

    pub fn from_intervals(uuid: Uuid, intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut list: Vec<Interval> = intervals.into_iter().collect();
        if list.is_empty() {
            return Self::new();
        }
        list.sort();
        let mut sets = BTreeMap::new();
        sets.insert(uuid, merge(list));
        Self { sets }
    }

    /// 从任意顺序的单个 GTID 构建集合
    pub fn from_gtids(gtids: impl IntoIterator<Item = Gtid>) -> Self {
        let mut raw: BTreeMap<Uuid, Vec<Interval>> = BTreeMap::new();
        for gtid in gtids {
            if let Some(interval) = Interval::single(gtid.number) {
                raw.entry(gtid.uuid).or_default().push(interval);
            }
        }
        let sets = raw
            .into_iter()
            .map(|(uuid, mut list)| {
                list.sort();
                (uuid, merge(list))
            })
            .collect();
        Self { sets }
    }

    pub fn single(gtid: Gtid) -> Self {
        match Interval::single(gtid.number) {
            Some(interval) => Self::from_intervals(gtid.uuid, [interval]),
            None => Self::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.sets.keys()
    }

    pub fn intervals(&self, uuid: &Uuid) -> &[Interval] {
        self.sets.get(uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 集合中单个 GTID 的数量
    pub fn count(&self) -> u64 {
        self.sets
            .values()
            .flat_map(|list| list.iter())
            .fold(0u64, |acc, iv| acc.saturating_add(iv.len()))
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        let Some(list) = self.sets.get(&gtid.uuid) else {
            return false;
        };
        let idx = list.partition_point(|iv| iv.end < gtid.number);
        list.get(idx).is_some_and(|iv| iv.start <= gtid.number)
    }

    /// self 的每个 GTID 都在 other 中
    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut sets = self.sets.clone();
        for (uuid, list) in &other.sets {
            let entry = sets.entry(*uuid).or_default();
            entry.extend_from_slice(list);
            entry.sort();
            *entry = merge(std::mem::take(entry));
        }
        Self { sets }
    }

    /// self − other
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut sets = BTreeMap::new();
        for (uuid, list) in &self.sets {
            let remaining = match other.sets.get(uuid) {
                Some(removed) => subtract_intervals(list, removed),
                None => list.clone(),
            };
            if !remaining.is_empty() {
                sets.insert(*uuid, remaining);
            }
        }
        Self { sets }
    }

    pub fn intersect(&self, other: &GtidSet) -> GtidSet {
        let mut sets = BTreeMap::new();
        for (uuid, list) in &self.sets {
            if let Some(theirs) = other.sets.get(uuid) {
                let common = intersect_intervals(list, theirs);
                if !common.is_empty() {
                    sets.insert(*uuid, common);
                }
            }
        }
        Self { sets }
    }

    /// 按 UUID、序号升序迭代单个 GTID
    pub fn iter(&self) -> impl Iterator<Item = Gtid> + '_ {
        self.sets.iter().flat_map(|(uuid, list)| {
            list.iter()
                .flat_map(move |iv| (iv.start..=iv.end).map(move |number| Gtid { uuid: *uuid, number }))
        })
    }
}

fn looks_like_uuid(part: &str) -> bool {
    part.len() >= 32 || part.matches('-').count() > 1 || part.chars().any(|c| c.is_ascii_alphabetic())
}

fn parse_interval(input: &str, part: &str) -> RplResult<Interval> {
    let number = |text: &str| {
        text.parse::<u64>()
            .map_err(|_| RplError::gtid_format(input, format!("invalid transaction number '{}'", text)))
    };
    let (start, end) = match part.split_once('-') {
        Some((a, b)) => (number(a)?, number(b)?),
        None => {
            let n = number(part)?;
            (n, n)
        }
    };
    if start == 0 {
        return Err(RplError::gtid_format(input, "transaction numbers start at 1"));
    }
    if start > end {
        return Err(RplError::gtid_format(input, format!("reversed interval '{}'", part)));
    }
    Ok(Interval { start, end })
}

// 输入必须已按 start 排序
fn merge(sorted: Vec<Interval>) -> Vec<Interval> {
    let mut out: Vec<Interval> = Vec::with_capacity(sorted.len());
    for iv in sorted {
        match out.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = max(last.end, iv.end);
            }
            _ => out.push(iv),
        }
    }
    out
}

fn subtract_intervals(list: &[Interval], removed: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    let mut j = 0;
    for iv in list {
        let mut start = iv.start;
        while j < removed.len() && removed[j].end < start {
            j += 1;
        }
        let mut consumed = false;
        let mut k = j;
        while k < removed.len() && removed[k].start <= iv.end {
            if removed[k].start > start {
                out.push(Interval { start, end: removed[k].start - 1 });
            }
            if removed[k].end >= iv.end {
                consumed = true;
                break;
            }
            start = removed[k].end + 1;
            k += 1;
        }
        if !consumed {
            out.push(Interval { start, end: iv.end });
        }
    }
    out
}

fn intersect_intervals(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = max(a[i].start, b[j].start);
        let end = min(a[i].end, b[j].end);
        if start <= end {
            out.push(Interval { start, end });
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (uuid, list)) in self.sets.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", uuid)?;
            for iv in list {
                write!(f, ":{}", iv)?;
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = RplError;

    fn from_str(s: &str) -> RplResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const U1: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const U2: &str = "ad1b3ba5-0000-11e1-9e33-c80aa9429562";

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    fn set(s: &str) -> GtidSet {
        GtidSet::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let gtids = set(&format!("{U1}:1-5:7, {U2}:3"));
        assert_eq!(gtids.to_string(), format!("{U1}:1-5:7,{U2}:3"));
        assert_eq!(gtids.count(), 7);
        assert!(set("").is_empty());
        assert!(set("  \n").is_empty());
    }

    #[test]
    fn test_entry_without_uuid_continues_previous() {
        let gtids = set(&format!("{U1}:10-12,15"));
        assert_eq!(gtids.to_string(), format!("{U1}:10-12:15"));
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let gtids = set(&format!("{U1}:1-3:4-6,\n{U1}:8"));
        assert_eq!(gtids.intervals(&uuid(U1)), &[Interval::new(1, 6).unwrap(), Interval::single(8).unwrap()]);
    }

    #[test]
    fn test_digit_only_uuid_is_recognized() {
        let digits = "11111111-1111-1111-1111-111111111111";
        let gtids = set(&format!("{digits}:1-2"));
        assert_eq!(gtids.count(), 2);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in [
            format!("{U1}:5-3"),
            format!("{U1}:0"),
            format!("{U1}:1-5:3-7"),
            format!("{U1}"),
            format!("{U1}:x"),
            format!("{U1}:1,,2"),
            "not-a-uuid-at-all:1".to_string(),
            "15".to_string(),
        ] {
            let err = GtidSet::parse(&bad).unwrap_err();
            assert!(matches!(err, RplError::GtidFormat { .. }), "{bad} -> {err}");
        }
    }

    #[test]
    fn test_subtract_single_gtid() {
        let requested = set(&format!("{U1}:10-12"));
        let executed = set(&format!("{U1}:10"));
        assert_eq!(requested.subtract(&executed).to_string(), format!("{U1}:11-12"));
    }

    #[test]
    fn test_subtract_splits_interval() {
        let a = set(&format!("{U1}:1-10,{U2}:1-3"));
        let b = set(&format!("{U1}:3-4:7,{U2}:1-3"));
        assert_eq!(a.subtract(&b).to_string(), format!("{U1}:1-2:5-6:8-10"));
    }

    #[test]
    fn test_intersect_union_contains() {
        let a = set(&format!("{U1}:1-10"));
        let b = set(&format!("{U1}:5-15,{U2}:1"));
        assert_eq!(a.intersect(&b).to_string(), format!("{U1}:5-10"));
        assert_eq!(a.union(&b).to_string(), format!("{U1}:1-15,{U2}:1"));
        assert!(b.contains(&Gtid { uuid: uuid(U2), number: 1 }));
        assert!(!a.contains(&Gtid { uuid: uuid(U1), number: 11 }));
        assert!(a.intersect(&b).is_subset(&a));
    }

    #[test]
    fn test_from_gtids_merges_runs() {
        let u = uuid(U1);
        let gtids = GtidSet::from_gtids([5, 3, 4, 9].map(|number| Gtid { uuid: u, number }));
        assert_eq!(gtids.to_string(), format!("{U1}:3-5:9"));
    }

    #[test]
    fn test_iter_ascending() {
        let gtids = set(&format!("{U2}:2,{U1}:3-4"));
        let listed: Vec<String> = gtids.iter().map(|g| g.to_string()).collect();
        assert_eq!(listed, vec![format!("{U1}:3"), format!("{U1}:4"), format!("{U2}:2")]);
    }

    fn arb_set() -> impl Strategy<Value = GtidSet> {
        prop::collection::vec((0usize..2, 1u64..60, 0u64..8), 0..12).prop_map(|items| {
            let uuids = [uuid(U1), uuid(U2)];
            items.into_iter().fold(GtidSet::new(), |acc, (u, start, len)| {
                let iv = Interval::new(start, start + len).unwrap();
                acc.union(&GtidSet::from_intervals(uuids[u], [iv]))
            })
        })
    }

    proptest! {
        #[test]
        fn prop_skip_set_disjoint_from_executed(requested in arb_set(), executed in arb_set()) {
            let to_skip = requested.subtract(&executed);
            prop_assert!(to_skip.intersect(&executed).is_empty());
            prop_assert!(requested.is_subset(&to_skip.union(&executed)));
        }

        #[test]
        fn prop_inclusion_exclusion(a in arb_set(), b in arb_set()) {
            prop_assert_eq!(
                a.union(&b).count(),
                a.count() + b.count() - a.intersect(&b).count()
            );
        }

        #[test]
        fn prop_display_parses_back(a in arb_set()) {
            prop_assert_eq!(GtidSet::parse(&a.to_string()).unwrap(), a.clone());
            prop_assert_eq!(a.iter().count() as u64, a.count());
        }
    }
}
