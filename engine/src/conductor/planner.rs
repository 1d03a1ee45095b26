//! Conductor Planner
//!
//! Asks the inference port to break a task into steps with explicit
//! dependency edges, then validates the result into a DAG ordered for
//! execution. A plan that cannot be parsed or ordered is a `PlanningError`;
//! there is no default plan to fall back on.

use crate::config::PlannerConfig;
use crate::llm::{InferencePort, Message};
use sdk::errors::PlanningError;
use sdk::types::{Complexity, Experience, Step, StepStatus};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A validated plan, steps in execution order
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub task_type: String,
    pub complexity: Complexity,
}

/// One step as the model described it, before ids are assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub key: String,
    pub description: String,
    pub dependencies: Vec<String>,
}

/// Models emit both `"step_1"` and `1` as ids
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl RawId {
    fn into_key(self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Number(n) => format!("step_{}", n),
        }
    }
}

/// Intermediate deserialization type for LLM JSON output
#[derive(Debug, Deserialize)]
struct RawPlanStep {
    id: Option<RawId>,
    #[serde(alias = "step", alias = "task")]
    description: String,
    #[serde(default, alias = "depends_on")]
    dependencies: Vec<RawId>,
}

pub struct Planner {
    llm: Arc<InferencePort>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(llm: Arc<InferencePort>, config: PlannerConfig) -> Self {
        Self { llm, config }
    }

    /// Plan a task
    ///
    /// `experiences` are retrieval results for the description. Only those
    /// within `similarity_threshold` reach the prompt.
    pub async fn plan(
        &self,
        task_id: &str,
        description: &str,
        experiences: &[Experience],
    ) -> Result<Plan, PlanningError> {
        tracing::info!("Planning task {}", task_id);

        let messages = self.build_prompt(description, experiences);
        let content = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| PlanningError::Inference(e.to_string()))?;

        let planned = parse_plan(&content)?;
        let ordered = validate_plan(planned, self.config.max_steps)?;
        let steps = assign_ids(task_id, ordered);

        tracing::info!("Created plan with {} steps for task {}", steps.len(), task_id);

        Ok(Plan {
            complexity: estimate_complexity(&steps),
            task_type: analyze_task_type(description).to_string(),
            steps,
        })
    }

    fn build_prompt(&self, description: &str, experiences: &[Experience]) -> Vec<Message> {
        let system_prompt = Message::system(format!(
            "You are an expert project planner. Break the user's task into clear, \
            actionable programming steps. Each step must be small enough to solve with \
            one standalone script.\n\
            Output ONLY a JSON array of at most {} steps. Each step object must have:\n\
            - \"id\": a unique string such as \"step_1\"\n\
            - \"description\": what the script for this step must do\n\
            - \"dependencies\": ids of earlier steps whose results this step uses\n\n\
            Example output:\n\
            [{{\"id\":\"step_1\",\"description\":\"Load the numbers from the input\",\"dependencies\":[]}},\
            {{\"id\":\"step_2\",\"description\":\"Print their sum\",\"dependencies\":[\"step_1\"]}}]\n\n\
            Output ONLY the JSON array, no markdown, no explanation.",
            self.config.max_steps
        ));

        let mut user_prompt = format!("Task: {}", description);
        let relevant: Vec<&Experience> = experiences
            .iter()
            .filter(|e| {
                e.distance
                    .is_some_and(|d| d <= self.config.similarity_threshold)
            })
            .collect();
        if !relevant.is_empty() {
            user_prompt.push_str("\n\nSimilar past experiences:\n");
            for exp in relevant {
                user_prompt.push_str(&format!("- [{}] {}\n", exp.outcome, exp.pattern));
            }
        }

        vec![system_prompt, Message::user(user_prompt)]
    }
}

/// Parse model output into planned steps
///
/// The JSON array between the first `[` and the last `]` is tried first.
/// Failing that, a numbered or bulleted list is accepted, each item
/// depending on the one before it.
pub fn parse_plan(content: &str) -> Result<Vec<PlannedStep>, PlanningError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(PlanningError::EmptyPlan);
    }

    let json_error = match parse_json_steps(trimmed) {
        Ok(steps) => return Ok(steps),
        Err(e) => e,
    };

    let listed = parse_list_steps(trimmed);
    if !listed.is_empty() {
        tracing::debug!("Plan was not JSON, using {} list items", listed.len());
        return Ok(listed);
    }

    Err(PlanningError::Unparsable(json_error))
}

fn parse_json_steps(content: &str) -> Result<Vec<PlannedStep>, String> {
    let start = content.find('[').ok_or("no JSON array in response")?;
    let end = content.rfind(']').ok_or("no JSON array in response")?;
    if end < start {
        return Err("no JSON array in response".to_string());
    }

    let raw_steps: Vec<RawPlanStep> =
        serde_json::from_str(&content[start..=end]).map_err(|e| e.to_string())?;

    raw_steps
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let description = raw.description.trim().to_string();
            if description.is_empty() {
                return Err(format!("step {} has no description", i + 1));
            }
            Ok(PlannedStep {
                key: raw
                    .id
                    .map(RawId::into_key)
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| format!("step_{}", i + 1)),
                description,
                dependencies: raw.dependencies.into_iter().map(RawId::into_key).collect(),
            })
        })
        .collect()
}

fn parse_list_steps(content: &str) -> Vec<PlannedStep> {
    let mut steps: Vec<PlannedStep> = Vec::new();

    for line in content.lines() {
        let Some(item) = list_item(line.trim()) else {
            continue;
        };
        let key = format!("step_{}", steps.len() + 1);
        let dependencies = steps.last().map(|s| vec![s.key.clone()]).unwrap_or_default();
        steps.push(PlannedStep {
            key,
            description: item.to_string(),
            dependencies,
        });
    }

    steps
}

/// Text of a `1.`, `1)`, `-` or `*` list item
fn list_item(line: &str) -> Option<&str> {
    let rest = if let Some(rest) = line.strip_prefix(['-', '*']) {
        rest
    } else {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        line[digits..].strip_prefix(['.', ')'])?
    };

    let item = rest.trim().trim_start_matches('[').trim_end_matches(']').trim();
    (!item.is_empty()).then_some(item)
}

/// Check a plan and put it in execution order
///
/// Rejects empty and oversized plans, duplicate ids, dangling edges and
/// cycles. The order is a Kahn topological sort that always releases the
/// ready step with the lowest original index, so a plan already in
/// dependency order keeps its order.
pub fn validate_plan(
    steps: Vec<PlannedStep>,
    max_steps: usize,
) -> Result<Vec<PlannedStep>, PlanningError> {
    if steps.is_empty() {
        return Err(PlanningError::EmptyPlan);
    }
    if steps.len() > max_steps {
        return Err(PlanningError::TooManySteps {
            count: steps.len(),
            max: max_steps,
        });
    }

    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if index_of.insert(step.key.as_str(), i).is_some() {
            return Err(PlanningError::DuplicateStepId(step.key.clone()));
        }
    }

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &step.dependencies {
            let Some(&d) = index_of.get(dep.as_str()) else {
                return Err(PlanningError::UnknownDependency {
                    step: step.key.clone(),
                    dependency: dep.clone(),
                });
            };
            if d == i {
                return Err(PlanningError::Cycle {
                    steps: vec![step.key.clone()],
                });
            }
            if seen.insert(d) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() < steps.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        return Err(PlanningError::Cycle {
            steps: (0..steps.len())
                .filter(|i| !placed.contains(i))
                .map(|i| steps[i].key.clone())
                .collect(),
        });
    }

    let mut slots: Vec<Option<PlannedStep>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .map(|mut step| {
            let mut seen = HashSet::new();
            step.dependencies.retain(|d| seen.insert(d.clone()));
            step
        })
        .collect())
}

/// Turn ordered planned steps into persisted steps
///
/// Dependencies are rewritten from planner keys to step ids.
fn assign_ids(task_id: &str, ordered: Vec<PlannedStep>) -> Vec<Step> {
    let ids: HashMap<String, String> = ordered
        .iter()
        .map(|s| (s.key.clone(), uuid::Uuid::new_v4().to_string()))
        .collect();

    ordered
        .into_iter()
        .enumerate()
        .map(|(i, planned)| Step {
            id: ids.get(&planned.key).cloned().unwrap_or_default(),
            task_id: task_id.to_string(),
            sequence_index: i as u32,
            dependencies: planned
                .dependencies
                .iter()
                .filter_map(|d| ids.get(d).cloned())
                .collect(),
            key: planned.key,
            description: planned.description,
            status: StepStatus::Pending,
            artifact: None,
            fix_attempts_used: 0,
            error_kind: None,
            error: None,
        })
        .collect()
}

const TASK_TYPES: &[(&str, &[&str])] = &[
    ("api_development", &["api", "endpoint", "endpoints", "rest", "http", "https"]),
    (
        "web_scraping",
        &["scrape", "scraping", "scraper", "crawl", "crawler", "crawling", "web", "html"],
    ),
    ("data_processing", &["data", "csv", "json", "parse", "parsing", "process", "processing"]),
    ("database", &["database", "sql", "sqlite", "query", "queries", "table", "tables"]),
    ("file_operations", &["file", "files", "read", "write", "io"]),
    ("testing", &["test", "tests", "unittest", "pytest"]),
];

/// Keyword classification of a task description
///
/// Classes are checked in a fixed order and the first with a whole-word
/// keyword match wins.
pub fn analyze_task_type(description: &str) -> &'static str {
    let lower = description.to_lowercase();
    let words: HashSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    TASK_TYPES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
        .map(|(name, _)| *name)
        .unwrap_or("general")
}

pub fn estimate_complexity(steps: &[Step]) -> Complexity {
    Complexity::from_step_count(steps.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(key: &str, deps: &[&str]) -> PlannedStep {
        PlannedStep {
            key: key.to_string(),
            description: format!("do {}", key),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn keys(steps: &[PlannedStep]) -> Vec<&str> {
        steps.iter().map(|s| s.key.as_str()).collect()
    }

    #[test]
    fn test_parse_steps_valid_json() {
        let json = r#"[
            {"id": "step_1", "description": "Read the numbers", "dependencies": []},
            {"id": "step_2", "description": "Sum them", "dependencies": ["step_1"]}
        ]"#;

        let steps = parse_plan(json).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].key, "step_1");
        assert_eq!(steps[1].dependencies, vec!["step_1"]);
    }

    #[test]
    fn test_parse_steps_with_markdown_wrapper() {
        let json = "Here is the plan:\n```json\n[{\"description\": \"Print hello\"}]\n```\nDone.";
        let steps = parse_plan(json).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].key, "step_1");
        assert!(steps[0].dependencies.is_empty());
    }

    #[test]
    fn test_parse_numeric_ids() {
        let json = r#"[{"id": 1, "description": "a"}, {"id": 2, "description": "b", "dependencies": [1]}]"#;
        let steps = parse_plan(json).unwrap();
        assert_eq!(steps[1].key, "step_2");
        assert_eq!(steps[1].dependencies, vec!["step_1"]);
    }

    #[test]
    fn test_numbered_list_becomes_chain() {
        let text = "Plan:\n1. Read the file\n2) Count the words\n- Print the count\n\nGood luck";
        let steps = parse_plan(text).unwrap();
        assert_eq!(keys(&steps), vec!["step_1", "step_2", "step_3"]);
        assert_eq!(steps[1].description, "Count the words");
        assert_eq!(steps[2].dependencies, vec!["step_2"]);
        assert!(steps[0].dependencies.is_empty());
    }

    #[test]
    fn test_unparsable_and_empty() {
        assert!(matches!(
            parse_plan("I cannot help with that."),
            Err(PlanningError::Unparsable(_))
        ));
        assert_eq!(parse_plan("   \n"), Err(PlanningError::EmptyPlan));
        assert!(matches!(
            parse_plan(r#"[{"description": "  "}]"#),
            Err(PlanningError::Unparsable(_))
        ));
    }

    #[test]
    fn test_validate_orders_dependencies_first() {
        let steps = vec![
            planned("c", &["b"]),
            planned("a", &[]),
            planned("b", &["a"]),
        ];
        let ordered = validate_plan(steps, 20).unwrap();
        assert_eq!(keys(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validate_keeps_independent_order() {
        let steps = vec![planned("x", &[]), planned("y", &[]), planned("z", &[])];
        let ordered = validate_plan(steps, 20).unwrap();
        assert_eq!(keys(&ordered), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_validate_rejects_malformed_plans() {
        assert_eq!(validate_plan(vec![], 5), Err(PlanningError::EmptyPlan));

        let too_many: Vec<_> = (0..4).map(|i| planned(&format!("s{}", i), &[])).collect();
        assert_eq!(
            validate_plan(too_many, 3),
            Err(PlanningError::TooManySteps { count: 4, max: 3 })
        );

        assert_eq!(
            validate_plan(vec![planned("a", &[]), planned("a", &[])], 5),
            Err(PlanningError::DuplicateStepId("a".to_string()))
        );

        assert_eq!(
            validate_plan(vec![planned("a", &["ghost"])], 5),
            Err(PlanningError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string()
            })
        );

        assert_eq!(
            validate_plan(vec![planned("a", &["a"])], 5),
            Err(PlanningError::Cycle {
                steps: vec!["a".to_string()]
            })
        );
    }

    #[test]
    fn test_validate_detects_cycle() {
        let steps = vec![
            planned("root", &[]),
            planned("a", &["b"]),
            planned("b", &["a"]),
        ];
        match validate_plan(steps, 20) {
            Err(PlanningError::Cycle { steps }) => assert_eq!(steps, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_assign_ids_maps_dependencies() {
        let ordered = validate_plan(vec![planned("a", &[]), planned("b", &["a", "a"])], 5).unwrap();
        let steps = assign_ids("t1", ordered);
        assert_eq!(steps[0].sequence_index, 0);
        assert_eq!(steps[1].sequence_index, 1);
        assert_eq!(steps[1].dependencies, vec![steps[0].id.clone()]);
        assert_eq!(steps[1].key, "b");
        assert_ne!(steps[0].id, steps[1].id);
    }

    #[test]
    fn test_analyze_task_type() {
        assert_eq!(analyze_task_type("Build a REST endpoint"), "api_development");
        assert_eq!(analyze_task_type("Scrape the headlines"), "web_scraping");
        assert_eq!(analyze_task_type("Parse a CSV and sum it"), "data_processing");
        assert_eq!(analyze_task_type("Create a SQL table"), "database");
        assert_eq!(analyze_task_type("Write lines to a file"), "file_operations");
        assert_eq!(analyze_task_type("Add pytest cases"), "testing");
        assert_eq!(analyze_task_type("Compute the ratio of two numbers"), "general");
    }
}
