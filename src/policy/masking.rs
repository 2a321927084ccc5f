//! Masking engine. Fixed fields are always redacted; diff
//! fields are redacted only when they change from the previously seen
//! value for the same run — the engine still tracks the real value for
//! that comparison even though the emitted copy is masked.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
pub struct MaskingConfig {
    pub fields: Vec<String>,
    pub diff_fields: Vec<String>,
    pub mask_value: JsonValue,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self { fields: Vec::new(), diff_fields: Vec::new(), mask_value: JsonValue::String("***".into()) }
    }
}

#[derive(Default)]
pub struct MaskingEngine {
    config: MaskingConfig,
    previous: Mutex<HashMap<String, HashMap<String, JsonValue>>>,
}

impl MaskingEngine {
    pub fn new(config: MaskingConfig) -> Self {
        Self { config, previous: Mutex::new(HashMap::new()) }
    }

    pub fn mask(&self, run_id: &str, payload: &HashMap<String, JsonValue>) -> HashMap<String, JsonValue> {
        let mut masked = payload.clone();

        for path in &self.config.fields {
            if get_path(&masked, path).is_some() {
                set_path(&mut masked, path, self.config.mask_value.clone());
            }
        }

        if !self.config.diff_fields.is_empty() {
            let mut previous = self.previous.lock().expect("masking engine mutex poisoned");
            let seen = previous.entry(run_id.to_string()).or_default();
            for path in &self.config.diff_fields {
                let Some(real_value) = get_path(&masked, path).cloned() else { continue };
                let changed = seen.get(path).map_or(false, |prev| prev != &real_value);
                seen.insert(path.clone(), real_value);
                if changed {
                    set_path(&mut masked, path, self.config.mask_value.clone());
                }
            }
        }

        masked
    }
}

fn get_path<'a>(payload: &'a HashMap<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = payload.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(payload: &mut HashMap<String, JsonValue>, path: &str, value: JsonValue) {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else { return };
    let segments: Vec<&str> = segments.collect();
    if segments.is_empty() {
        payload.insert(first.to_string(), value);
        return;
    }
    let Some(mut current) = payload.get_mut(first) else { return };
    for (i, segment) in segments.iter().enumerate() {
        let Some(obj) = current.as_object_mut() else { return };
        if i == segments.len() - 1 {
            obj.insert(segment.to_string(), value);
            return;
        }
        let Some(next) = obj.get_mut(*segment) else { return };
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn masks_fixed_fields_unconditionally() {
        let engine = MaskingEngine::new(MaskingConfig {
            fields: vec!["secret".into()],
            diff_fields: Vec::new(),
            mask_value: json!("***"),
        });
        let p = payload(&[("secret", json!("abc")), ("public", json!("ok"))]);
        let masked = engine.mask("r1", &p);
        assert_eq!(masked["secret"], json!("***"));
        assert_eq!(masked["public"], json!("ok"));
    }

    #[test]
    fn fixed_field_masking_is_idempotent() {
        let engine = MaskingEngine::new(MaskingConfig {
            fields: vec!["secret".into()],
            diff_fields: Vec::new(),
            mask_value: json!("***"),
        });
        let p = payload(&[("secret", json!("abc"))]);
        let once = engine.mask("r1", &p);
        let twice = engine.mask("r1", &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn diff_field_masks_only_on_change() {
        let engine = MaskingEngine::new(MaskingConfig {
            fields: Vec::new(),
            diff_fields: vec!["value".into()],
            mask_value: json!("***"),
        });
        let first = payload(&[("value", json!("a"))]);
        let masked_first = engine.mask("r1", &first);
        assert_eq!(masked_first["value"], json!("a"));

        let second = payload(&[("value", json!("a"))]);
        let masked_second = engine.mask("r1", &second);
        assert_eq!(masked_second["value"], json!("a"));

        let third = payload(&[("value", json!("b"))]);
        let masked_third = engine.mask("r1", &third);
        assert_eq!(masked_third["value"], json!("***"));
    }

    #[test]
    fn nested_path_masking_tolerates_missing_segments() {
        let engine = MaskingEngine::new(MaskingConfig {
            fields: vec!["a.b.c".into()],
            diff_fields: Vec::new(),
            mask_value: json!("***"),
        });
        let p = payload(&[("a", json!({"b": {}}))]);
        let masked = engine.mask("r1", &p);
        assert_eq!(masked, p);
    }
}
