//! Scenario configuration: the YAML-declared step graph a call flow runs
//! through, plus the per-scenario STT/LLM tuning. Ported from
//! `config/flow_definition.py`'s dataclasses.

pub mod registry;

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub hotwords: Vec<String>,
    #[serde(default = "default_max_duration")]
    pub max_duration: u32,
    #[serde(default = "default_max_silence")]
    pub max_silence: u32,
}

fn default_max_duration() -> u32 {
    10
}
fn default_max_silence() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub prompt_template: String,
    #[serde(default = "default_intent_categories")]
    pub intent_categories: Vec<String>,
    #[serde(default)]
    pub fallback_tokens: HashMap<String, Vec<String>>,
}

fn default_intent_categories() -> Vec<String> {
    vec![
        "yes".into(),
        "no".into(),
        "number_question".into(),
        "unknown".into(),
    ]
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            prompt_template: String::new(),
            intent_categories: default_intent_categories(),
            fallback_tokens: HashMap::new(),
        }
    }
}

/// One node in a scenario's step graph. `step` ids are unique per flow.
/// Fields are a tagged union in spirit (only the fields relevant to
/// `step_type` are populated) rather than in Rust's type system, matching
/// the loose shape the YAML schema (§6) actually allows — unknown/absent
/// fields are simply `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowStep {
    pub step: String,
    #[serde(rename = "type")]
    pub step_type: StepType,

    #[serde(default)]
    pub next: Option<String>,

    // play_prompt
    #[serde(default)]
    pub prompt: Option<String>,

    // record
    #[serde(default)]
    pub on_empty: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,

    // classify_intent / route_by_intent
    #[serde(default)]
    pub routes: Option<HashMap<String, String>>,

    // check_retry_limit
    #[serde(default)]
    pub counter: Option<String>,
    #[serde(default)]
    pub max_count: Option<u32>,
    #[serde(default)]
    pub within_limit: Option<String>,
    #[serde(default)]
    pub exceeded: Option<String>,

    // set_result
    #[serde(default)]
    pub result: Option<String>,

    // transfer_to_operator
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    #[serde(default)]
    pub on_success: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Entry,
    PlayPrompt,
    Record,
    ClassifyIntent,
    RouteByIntent,
    CheckRetryLimit,
    SetResult,
    TransferToOperator,
    Disconnect,
    Hangup,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub panel_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub prompts: HashMap<String, String>,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub flow: Vec<FlowStep>,
    #[serde(default)]
    pub inbound_flow: Vec<FlowStep>,
}

impl ScenarioConfig {
    pub fn get_step(&self, step_id: &str, inbound: bool) -> Option<&FlowStep> {
        let steps = if inbound { &self.inbound_flow } else { &self.flow };
        steps.iter().find(|s| s.step == step_id)
    }

    pub fn get_entry_step(&self, inbound: bool) -> Option<&FlowStep> {
        let steps = if inbound { &self.inbound_flow } else { &self.flow };
        steps
            .iter()
            .find(|s| s.step_type == StepType::Entry)
            .or_else(|| steps.first())
    }

    /// §9's load-time check: every step id a step names as a successor must
    /// exist in the same flow, and no step may name itself without an
    /// intervening input-consuming step (record/classify/retry/play) —
    /// those are the step types the interpreter can actually suspend and
    /// resume through; a bare step naming itself would spin forever.
    /// Returns human-readable problems rather than failing the load, since
    /// the rest of this loader tolerates malformed scenario files (logs and
    /// skips) rather than aborting startup over one bad file.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        problems.extend(validate_flow(&self.name, "flow", &self.flow));
        if !self.inbound_flow.is_empty() {
            problems.extend(validate_flow(&self.name, "inbound_flow", &self.inbound_flow));
        }
        problems
    }
}

fn validate_flow(scenario: &str, flow_name: &str, steps: &[FlowStep]) -> Vec<String> {
    let mut problems = Vec::new();
    let ids: std::collections::HashSet<&str> = steps.iter().map(|s| s.step.as_str()).collect();

    let check = |problems: &mut Vec<String>, from: &str, target: &Option<String>, field: &str| {
        if let Some(target) = target {
            if !ids.contains(target.as_str()) {
                problems.push(format!(
                    "{scenario}/{flow_name}: step '{from}' refers to unknown step '{target}' via {field}"
                ));
            }
        }
    };

    for step in steps {
        check(&mut problems, &step.step, &step.next, "next");
        check(&mut problems, &step.step, &step.on_empty, "on_empty");
        check(&mut problems, &step.step, &step.on_failure, "on_failure");
        check(&mut problems, &step.step, &step.within_limit, "within_limit");
        check(&mut problems, &step.step, &step.exceeded, "exceeded");
        check(&mut problems, &step.step, &step.on_success, "on_success");
        if let Some(routes) = &step.routes {
            for target in routes.values() {
                check(&mut problems, &step.step, &Some(target.clone()), "routes");
            }
        }

        // A self-referencing step is only safe for the types that suspend
        // execution on a PBX event before resuming — anything else would
        // spin inline with no external input to break the loop.
        let self_loops_via = |target: &Option<String>| target.as_deref() == Some(step.step.as_str());
        let suspends = matches!(
            step.step_type,
            StepType::Record | StepType::ClassifyIntent | StepType::CheckRetryLimit | StepType::PlayPrompt
        );
        if !suspends && (self_loops_via(&step.next) || self_loops_via(&step.on_success)) {
            problems.push(format!(
                "{scenario}/{flow_name}: step '{}' loops to itself with no intervening input-consuming step",
                step.step
            ));
        }
    }

    problems
}

/// Wrapper matching the YAML schema's `scenario:` top-level key; some
/// scenario files omit the wrapper and put fields at the document root
/// (the original loader tolerates both via `data.get("scenario", data)`).
#[derive(Debug, Deserialize)]
struct ScenarioDocument {
    scenario: Option<ScenarioConfigRaw>,
    #[serde(flatten)]
    inline: ScenarioConfigRaw,
}

#[derive(Debug, Deserialize)]
struct ScenarioConfigRaw {
    #[serde(default)]
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    panel_name: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    prompts: HashMap<String, String>,
    #[serde(default)]
    stt: SttConfig,
    #[serde(default)]
    llm: LlmConfig,
    #[serde(default)]
    flow: Vec<FlowStep>,
    #[serde(default)]
    inbound_flow: Vec<FlowStep>,
}

impl From<ScenarioConfigRaw> for ScenarioConfig {
    fn from(raw: ScenarioConfigRaw) -> Self {
        ScenarioConfig {
            name: raw.name,
            display_name: raw.display_name,
            panel_name: raw.panel_name,
            company: raw.company,
            prompts: raw.prompts,
            stt: raw.stt,
            llm: raw.llm,
            flow: raw.flow,
            inbound_flow: raw.inbound_flow,
        }
    }
}

pub(crate) fn parse_scenario_yaml(contents: &str) -> Result<ScenarioConfig, serde_yaml::Error> {
    let doc: ScenarioDocument = serde_yaml::from_str(contents)?;
    let raw = doc.scenario.unwrap_or(doc.inline);
    Ok(raw.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_flags_dangling_step_reference() {
        let yaml = r#"
name: broken
flow:
  - step: start
    type: entry
    next: greet
"#;
        let cfg = parse_scenario_yaml(yaml).unwrap();
        let problems = cfg.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("greet"));
    }

    #[test]
    fn validate_flags_self_loop_on_non_suspending_step() {
        let yaml = r#"
name: spinning
flow:
  - step: start
    type: entry
    next: start
"#;
        let cfg = parse_scenario_yaml(yaml).unwrap();
        let problems = cfg.validate();
        assert!(problems.iter().any(|p| p.contains("loops to itself")));
    }

    #[test]
    fn validate_allows_self_loop_on_record_step() {
        let yaml = r#"
name: retry-loop
flow:
  - step: ask
    type: record
    next: ask
"#;
        let cfg = parse_scenario_yaml(yaml).unwrap();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_checks_routes_and_inbound_flow() {
        let yaml = r#"
name: routed
flow:
  - step: start
    type: route_by_intent
    routes:
      yes: missing_step
inbound_flow:
  - step: in_start
    type: entry
    next: also_missing
"#;
        let cfg = parse_scenario_yaml(yaml).unwrap();
        let problems = cfg.validate();
        assert_eq!(problems.len(), 2);
    }
}
