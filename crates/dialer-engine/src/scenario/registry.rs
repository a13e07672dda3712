//! Loads every `*.yaml`/`*.yml` scenario file from a directory and hands
//! out round-robin selections for the dialer and inbound router. Ported
//! from `logic/scenario_registry.py::ScenarioRegistry`.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ScenarioConfig;

pub struct ScenarioRegistry {
    scenarios: HashMap<String, ScenarioConfig>,
    enabled: Mutex<Vec<String>>,
    outbound_cursor: Mutex<usize>,
    inbound_cursor: Mutex<usize>,
}

impl ScenarioRegistry {
    /// Loads every scenario file under `dir`. When `company` is non-empty,
    /// scenarios whose own `company` field is set and differs are skipped —
    /// matching the original loader's company-scoping.
    pub fn load_dir(dir: impl AsRef<Path>, company: &str) -> std::io::Result<ScenarioRegistry> {
        let dir = dir.as_ref();
        let mut scenarios = HashMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "scenario directory unreadable");
                return Ok(ScenarioRegistry::empty());
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            match super::parse_scenario_yaml(&contents) {
                Ok(cfg) => {
                    if !company.is_empty() && !cfg.company.is_empty() && cfg.company != company {
                        debug!(file = %path.display(), "skipping scenario for other company");
                        continue;
                    }
                    for problem in cfg.validate() {
                        warn!(file = %path.display(), %problem, "scenario step graph problem");
                    }
                    info!(name = %cfg.name, file = %path.display(), "loaded scenario");
                    scenarios.insert(cfg.name.clone(), cfg);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to parse scenario file");
                }
            }
        }

        let enabled: Vec<String> = scenarios.keys().cloned().collect();
        Ok(ScenarioRegistry {
            scenarios,
            enabled: Mutex::new(enabled),
            outbound_cursor: Mutex::new(0),
            inbound_cursor: Mutex::new(0),
        })
    }

    pub fn empty() -> ScenarioRegistry {
        ScenarioRegistry {
            scenarios: HashMap::new(),
            enabled: Mutex::new(Vec::new()),
            outbound_cursor: Mutex::new(0),
            inbound_cursor: Mutex::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ScenarioConfig> {
        self.scenarios.get(name)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &ScenarioConfig> {
        self.scenarios.values()
    }

    pub fn get_names(&self) -> Vec<String> {
        self.scenarios.keys().cloned().collect()
    }

    pub fn get_enabled(&self) -> Vec<String> {
        self.enabled.lock().clone()
    }

    /// Panel-driven update of the active-scenario set. Resets both
    /// round-robin cursors since the underlying list changed shape.
    pub fn set_enabled(&self, names: Vec<String>) {
        let names: Vec<String> = names
            .into_iter()
            .filter(|n| self.scenarios.contains_key(n))
            .collect();
        *self.enabled.lock() = names;
        *self.outbound_cursor.lock() = 0;
        *self.inbound_cursor.lock() = 0;
    }

    /// Round-robins over the enabled set for outbound dialing.
    pub fn next_scenario(&self) -> Option<&ScenarioConfig> {
        let enabled = self.enabled.lock();
        if enabled.is_empty() {
            return None;
        }
        let mut cursor = self.outbound_cursor.lock();
        let name = enabled[*cursor % enabled.len()].clone();
        *cursor = (*cursor + 1) % enabled.len();
        self.scenarios.get(&name)
    }

    /// Round-robins only over enabled scenarios that define a non-empty
    /// `inbound_flow`; returns `None` if none qualify.
    pub fn next_inbound_scenario(&self) -> Option<&ScenarioConfig> {
        let enabled = self.enabled.lock();
        let candidates: Vec<&String> = enabled
            .iter()
            .filter(|n| {
                self.scenarios
                    .get(*n)
                    .is_some_and(|c| !c.inbound_flow.is_empty())
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let mut cursor = self.inbound_cursor.lock();
        let name = candidates[*cursor % candidates.len()].clone();
        *cursor = (*cursor + 1) % candidates.len();
        self.scenarios.get(name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, with_inbound: bool) -> ScenarioConfig {
        let inbound_flow = if with_inbound {
            r#"
inbound_flow:
  - step: greet
    type: entry
"#
        } else {
            ""
        };
        let yaml = format!(
            "name: {name}\nflow:\n  - step: start\n    type: entry\n{inbound_flow}"
        );
        super::super::parse_scenario_yaml(&yaml).unwrap()
    }

    fn registry_with(scenarios: Vec<ScenarioConfig>) -> ScenarioRegistry {
        let names: Vec<String> = scenarios.iter().map(|s| s.name.clone()).collect();
        let map = scenarios.into_iter().map(|s| (s.name.clone(), s)).collect();
        ScenarioRegistry {
            scenarios: map,
            enabled: Mutex::new(names),
            outbound_cursor: Mutex::new(0),
            inbound_cursor: Mutex::new(0),
        }
    }

    #[test]
    fn next_scenario_round_robins() {
        let reg = registry_with(vec![sample("a", false), sample("b", false)]);
        let first = reg.next_scenario().unwrap().name.clone();
        let second = reg.next_scenario().unwrap().name.clone();
        let third = reg.next_scenario().unwrap().name.clone();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn next_inbound_scenario_skips_flows_without_inbound() {
        let reg = registry_with(vec![sample("no-inbound", false), sample("has-inbound", true)]);
        assert_eq!(reg.next_inbound_scenario().unwrap().name, "has-inbound");
        assert_eq!(reg.next_inbound_scenario().unwrap().name, "has-inbound");
    }

    #[test]
    fn next_inbound_scenario_none_when_no_flow_qualifies() {
        let reg = registry_with(vec![sample("a", false)]);
        assert!(reg.next_inbound_scenario().is_none());
    }

    #[test]
    fn set_enabled_filters_unknown_names() {
        let reg = registry_with(vec![sample("a", false)]);
        reg.set_enabled(vec!["a".to_string(), "ghost".to_string()]);
        assert_eq!(reg.get_enabled(), vec!["a".to_string()]);
    }
}
