//! Vendor quirks for Extension Unit controls.
//!
//! Extension Units only advertise a GUID and a control count; everything
//! else (names, payload layouts, value types) is vendor lore. Quirks files
//! capture that lore as JSON, keyed by GUID. During control enumeration each
//! probed XU control is matched against the definitions for its unit's GUID
//! and, on a match, picks up the definition's name and metadata.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::control::ValueKind;
use crate::error::Error;
use crate::Result;

/// Quirks files shipped with the driver.
const BUILTIN: &[(&str, &str)] = &[("uvc-h264-xu.json", include_str!("../quirks/uvc-h264-xu.json"))];

/// Keys that configure matching rather than describe the control; they are
/// not copied into the control's metadata.
const MATCHER_KEYS: &[&str] = &[
    "selector",
    "expected_info",
    "get_info_expect",
    "expected_length",
    "payload",
    "name",
    "type",
];

/// One control definition from a quirks file.
#[derive(Debug, Clone)]
pub struct QuirkDef {
    selector: Option<u8>,
    /// Acceptable info bytes; equality against any member.
    expected_info: Option<Vec<u8>>,
    /// Mandatory exact info byte from `get_info_expect.value`.
    info_value: Option<u8>,
    /// Soft per-bit constraints from `get_info_expect.Dn` keys.
    info_bits: Vec<(u8, bool)>,
    fixed_len: Option<u16>,
    min_len: Option<u16>,
    max_len: Option<u16>,
    pub name: String,
    pub kind: Option<ValueKind>,
    /// Descriptive keys, merged into the matched control's metadata.
    pub metadata: Map<String, Value>,
}

impl QuirkDef {
    /// Scores this definition against a probed control. `None` means a
    /// mandatory constraint failed.
    fn score(&self, selector: u8, info: u8, length: Option<u16>) -> Option<i32> {
        let mut score = 0;

        if let Some(sel) = self.selector {
            if sel != selector {
                return None;
            }
            score += 5;
        }
        if let Some(accepted) = &self.expected_info {
            if !accepted.contains(&info) {
                return None;
            }
            score += 2;
        }
        if let Some(value) = self.info_value {
            if value != info {
                return None;
            }
            score += 2;
        }
        for &(bit, expect_set) in &self.info_bits {
            if (info >> bit) & 1 == u8::from(expect_set) {
                score += 1;
            }
        }
        if let Some(expected) = self.fixed_len {
            if length != Some(expected) {
                return None;
            }
            score += 2;
        }
        if self.min_len.is_some() || self.max_len.is_some() {
            if let Some(len) = length {
                let lo = self.min_len.unwrap_or(0);
                let hi = self.max_len.unwrap_or(u16::MAX);
                if (lo..=hi).contains(&len) {
                    score += 1;
                }
            }
        }

        Some(score)
    }
}

/// All loaded quirk definitions, indexed by Extension Unit GUID.
#[derive(Debug, Clone, Default)]
pub struct QuirksRegistry {
    defs: HashMap<Uuid, Vec<QuirkDef>>,
}

impl QuirksRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The definitions bundled with the driver.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, text) in BUILTIN {
            if let Err(e) = registry.load_str(Path::new(name), text) {
                // Shipped files are covered by tests; never fatal at runtime.
                log::error!("builtin quirks file {} is invalid: {}", name, e);
            }
        }
        registry
    }

    /// Loads every `*.json` file in `dir` on top of the current contents.
    /// A missing directory is not an error.
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("quirks directory {:?} does not exist", dir);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::QuirksLoad {
                    path: dir.to_path_buf(),
                    cause: e.to_string(),
                })
            }
        };

        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    return Err(Error::QuirksLoad {
                        path: dir.to_path_buf(),
                        cause: e.to_string(),
                    })
                }
            };
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|e| Error::QuirksLoad {
                path: path.clone(),
                cause: e.to_string(),
            })?;
            self.load_str(&path, &text)?;
        }
        Ok(())
    }

    /// Parses one quirks file.
    pub fn load_str(&mut self, path: &Path, text: &str) -> Result<()> {
        let quirks_err = |cause: String| Error::QuirksLoad {
            path: path.to_path_buf(),
            cause,
        };

        let root: Value =
            serde_json::from_str(text).map_err(|e| quirks_err(e.to_string()))?;
        let guid = root
            .get("guid")
            .and_then(Value::as_str)
            .ok_or_else(|| quirks_err("missing `guid` key".into()))?;
        let guid = Uuid::parse_str(guid).map_err(|e| quirks_err(format!("bad guid: {}", e)))?;

        let mut defs = Vec::new();
        match root.get("controls") {
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    let selector = parse_int(&Value::String(key.clone()))
                        .ok_or_else(|| quirks_err(format!("bad selector key `{}`", key)))?;
                    let mut def = parse_def(value).map_err(quirks_err)?;
                    def.selector = Some(selector as u8);
                    defs.push(def);
                }
            }
            Some(Value::Array(list)) => {
                for value in list {
                    defs.push(parse_def(value).map_err(quirks_err)?);
                }
            }
            _ => return Err(quirks_err("missing `controls` key".into())),
        }

        log::debug!("loaded {} quirk definitions for {}", defs.len(), guid);
        self.defs.entry(guid).or_default().extend(defs);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Starts a matching pass. Consumed definitions are tracked per pass,
    /// never in the registry itself.
    pub(crate) fn pass(&self) -> QuirkPass<'_> {
        QuirkPass {
            registry: self,
            used: HashMap::new(),
        }
    }
}

/// Pass-local matching state over a [`QuirksRegistry`].
pub(crate) struct QuirkPass<'a> {
    registry: &'a QuirksRegistry,
    used: HashMap<Uuid, Vec<bool>>,
}

impl<'a> QuirkPass<'a> {
    /// Returns the best-scoring unused definition for the control, marking
    /// it consumed.
    pub(crate) fn best_match(
        &mut self,
        guid: &Uuid,
        selector: u8,
        info: u8,
        length: Option<u16>,
    ) -> Option<&'a QuirkDef> {
        let defs = self.registry.defs.get(guid)?;
        let used = self
            .used
            .entry(*guid)
            .or_insert_with(|| vec![false; defs.len()]);

        let mut best: Option<(i32, usize)> = None;
        for (i, def) in defs.iter().enumerate() {
            if used[i] {
                continue;
            }
            if let Some(score) = def.score(selector, info, length) {
                if best.map_or(true, |(b, _)| score > b) {
                    best = Some((score, i));
                }
            }
        }

        let (score, i) = best?;
        used[i] = true;
        log::debug!(
            "quirk `{}` matched selector {} on {} (score {})",
            defs[i].name,
            selector,
            guid,
            score
        );
        Some(&defs[i])
    }
}

fn parse_def(value: &Value) -> std::result::Result<QuirkDef, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("control definition is not an object: {}", value))?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| "control definition has no `name`".to_string())?
        .to_string();

    let selector = obj.get("selector").and_then(parse_int).map(|v| v as u8);

    let expected_info = match obj.get("expected_info") {
        None => None,
        Some(Value::Array(list)) => Some(
            list.iter()
                .map(|v| parse_int(v).map(|v| v as u8))
                .collect::<Option<Vec<u8>>>()
                .ok_or("bad `expected_info` list")?,
        ),
        Some(v) => Some(vec![parse_int(v).ok_or("bad `expected_info`")? as u8]),
    };

    let mut info_value = None;
    let mut info_bits = Vec::new();
    if let Some(expect) = obj.get("get_info_expect") {
        let expect = expect
            .as_object()
            .ok_or("`get_info_expect` is not an object")?;
        for (key, v) in expect {
            if key == "value" {
                info_value = Some(parse_int(v).ok_or("bad `get_info_expect.value`")? as u8);
            } else if let Some(bit) = key.strip_prefix('D').and_then(|d| d.parse::<u8>().ok()) {
                let set = parse_int(v).ok_or("bad bit constraint")? != 0;
                info_bits.push((bit, set));
            } else {
                return Err(format!("unknown `get_info_expect` key `{}`", key));
            }
        }
    }

    let mut fixed_len = obj
        .get("expected_length")
        .and_then(parse_int)
        .map(|v| v as u16);
    let mut min_len = None;
    let mut max_len = None;
    if let Some(payload) = obj.get("payload") {
        let payload = payload.as_object().ok_or("`payload` is not an object")?;
        if let Some(v) = payload.get("fixed_len").and_then(parse_int) {
            fixed_len = Some(v as u16);
        }
        min_len = payload.get("min_len").and_then(parse_int).map(|v| v as u16);
        max_len = payload.get("max_len").and_then(parse_int).map(|v| v as u16);
    }

    let kind = match obj.get("type").and_then(Value::as_str) {
        None => None,
        Some(s) => Some(
            ValueKind::from_name(s).ok_or_else(|| format!("unknown control type `{}`", s))?,
        ),
    };

    let metadata = obj
        .iter()
        .filter(|(key, _)| !MATCHER_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(QuirkDef {
        selector,
        expected_info,
        info_value,
        info_bits,
        fixed_len,
        min_len,
        max_len,
        name,
        kind,
        metadata,
    })
}

/// Accepts JSON numbers as well as decimal/`0x` strings.
fn parse_int(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        Value::Bool(b) => Some(u64::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from(text: &str) -> QuirksRegistry {
        let mut registry = QuirksRegistry::empty();
        registry.load_str(Path::new("test.json"), text).unwrap();
        registry
    }

    const GUID: &str = "a29e7641-de04-47e3-8b2b-f4341aff003b";

    #[test]
    fn selector_and_info_matching() {
        let registry = registry_from(
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": [
                    { "selector": 5, "name": "A" },
                    { "expected_info": "0x03", "name": "B" }
                ]
            }"#,
        );
        let guid = Uuid::parse_str(GUID).unwrap();
        let mut pass = registry.pass();

        let a = pass.best_match(&guid, 5, 0x03, None).unwrap();
        assert_eq!(a.name, "A");
        let b = pass.best_match(&guid, 9, 0x03, None).unwrap();
        assert_eq!(b.name, "B");
        assert!(pass.best_match(&guid, 9, 0x03, None).is_none());
    }

    #[test]
    fn definitions_are_consumed_once_per_pass() {
        let registry = registry_from(
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": [
                    { "selector": 5, "name": "first" },
                    { "selector": 5, "name": "second" }
                ]
            }"#,
        );
        let guid = Uuid::parse_str(GUID).unwrap();

        let mut pass = registry.pass();
        assert_eq!(pass.best_match(&guid, 5, 0x03, None).unwrap().name, "first");
        assert_eq!(
            pass.best_match(&guid, 5, 0x03, None).unwrap().name,
            "second"
        );

        // A fresh pass starts over; the registry was not mutated.
        let mut pass = registry.pass();
        assert_eq!(pass.best_match(&guid, 5, 0x03, None).unwrap().name, "first");
    }

    #[test]
    fn mandatory_length_mismatch_disqualifies() {
        let registry = registry_from(
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": [
                    { "expected_length": 4, "name": "word" },
                    { "payload": { "min_len": 1, "max_len": 2 }, "name": "short" }
                ]
            }"#,
        );
        let guid = Uuid::parse_str(GUID).unwrap();
        let mut pass = registry.pass();

        // length 2 disqualifies `word` and scores `short` via inclusion.
        let hit = pass.best_match(&guid, 1, 0x03, Some(2)).unwrap();
        assert_eq!(hit.name, "short");
        let hit = pass.best_match(&guid, 2, 0x03, Some(4)).unwrap();
        assert_eq!(hit.name, "word");
    }

    #[test]
    fn selector_keyed_map_and_metadata() {
        let registry = registry_from(
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": {
                    "0x0a": { "name": "Version", "type": "int", "length": 2, "unit": "bcd" }
                }
            }"#,
        );
        let guid = Uuid::parse_str(GUID).unwrap();
        let mut pass = registry.pass();

        let hit = pass.best_match(&guid, 0x0A, 0x03, None).unwrap();
        assert_eq!(hit.name, "Version");
        assert_eq!(hit.kind, Some(ValueKind::Int));
        // Matcher keys stay out of the metadata; descriptive keys survive.
        assert!(hit.metadata.get("name").is_none());
        assert_eq!(hit.metadata.get("length"), Some(&Value::from(2)));
        assert_eq!(hit.metadata.get("unit"), Some(&Value::from("bcd")));
    }

    #[test]
    fn get_info_bits_break_ties() {
        let registry = registry_from(
            r#"{
                "guid": "a29e7641-de04-47e3-8b2b-f4341aff003b",
                "controls": [
                    { "get_info_expect": { "D0": 1, "D1": 1 }, "name": "rw" },
                    { "get_info_expect": { "D0": 1, "D1": 0 }, "name": "ro" }
                ]
            }"#,
        );
        let guid = Uuid::parse_str(GUID).unwrap();
        let mut pass = registry.pass();

        assert_eq!(pass.best_match(&guid, 1, 0x01, None).unwrap().name, "ro");
        assert_eq!(pass.best_match(&guid, 2, 0x03, None).unwrap().name, "rw");
    }

    #[test]
    fn builtin_files_parse() {
        let registry = QuirksRegistry::builtin();
        assert!(!registry.is_empty());
    }
}
