use serde_json::Value;
use std::path::Path;

/// Splits a total token count into (input, cache_creation, cache_read) using a
/// fixed 1:2:25 ratio. Kiro's upstream never reports the three figures
/// separately, only a total; this reproduces the billing shape the rest of
/// the system expects without pretending to measure anything physical.
/// Below 100 tokens the ratio stops being meaningful, so the whole amount is
/// reported as `input`.
pub(super) fn distribute_kiro_tokens(total: u64) -> (u64, u64, u64) {
    if total < 100 {
        return (total, 0, 0);
    }
    let input = total / 28;
    let cache_creation = 2 * total / 28;
    let cache_read = total - input - cache_creation;
    (input, cache_creation, cache_read)
}

pub(super) struct DebugDump {
    dir: std::path::PathBuf,
}

impl DebugDump {
    pub fn start(base_dir: &str, session_id: &str) -> Self {
        let dir = Path::new(base_dir).join(session_id);
        Self { dir }
    }

    fn ensure_dir(&self, outcome: &str) -> std::path::PathBuf {
        let dir = self.dir.parent().unwrap_or(&self.dir).join(outcome).join(
            self.dir
                .file_name()
                .unwrap_or_default(),
        );
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn write_json(&self, outcome: &str, name: &str, value: &Value) {
        let dir = self.ensure_dir(outcome);
        if let Ok(bytes) = serde_json::to_vec_pretty(value) {
            let _ = std::fs::write(dir.join(name), bytes);
        }
    }

    pub fn write_metadata(&self, outcome: &str, metadata: &Value) {
        self.write_json(outcome, "metadata.json", metadata);
    }

    pub fn write_request(&self, outcome: &str, request: &Value) {
        self.write_json(outcome, "request.json", request);
    }

    pub fn write_kiro_request(&self, outcome: &str, request: &Value) {
        self.write_json(outcome, "kiro_request.json", request);
    }

    pub fn write_response(&self, outcome: &str, response: &Value) {
        self.write_json(outcome, "response.json", response);
    }

    pub fn append_jsonl(&self, outcome: &str, name: &str, value: &Value) {
        let dir = self.ensure_dir(outcome);
        if let Ok(mut line) = serde_json::to_vec(value) {
            line.push(b'\n');
            use std::io::Write;
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
            {
                let _ = file.write_all(&line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_splits_large_totals_by_ratio() {
        let (input, cache_creation, cache_read) = distribute_kiro_tokens(2800);
        assert_eq!(input, 100);
        assert_eq!(cache_creation, 200);
        assert_eq!(cache_read, 2500);
        assert_eq!(input + cache_creation + cache_read, 2800);
    }

    #[test]
    fn distribute_keeps_small_totals_as_input_only() {
        assert_eq!(distribute_kiro_tokens(42), (42, 0, 0));
    }

    #[test]
    fn distribute_always_sums_to_total() {
        for total in [0u64, 1, 27, 99, 100, 101, 999, 123_456] {
            let (input, cache_creation, cache_read) = distribute_kiro_tokens(total);
            assert_eq!(input + cache_creation + cache_read, total);
        }
    }
}
