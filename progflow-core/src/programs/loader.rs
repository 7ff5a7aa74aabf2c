use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::programs::types::Program;

const PROGRAM_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];
const MAX_DISCOVERY_DEPTH: usize = 4;

/// Reads program definitions from YAML or JSON files.
pub struct ProgramLoader;

impl ProgramLoader {
    fn is_yaml(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|value| value.to_str()),
            Some("yaml" | "yml")
        )
    }

    fn has_program_extension(path: &Path) -> bool {
        path.extension()
            .and_then(|value| value.to_str())
            .is_some_and(|ext| PROGRAM_EXTENSIONS.contains(&ext))
    }

    /// Parses a program from text. YAML is converted to JSON first so both
    /// formats go through the same serde model.
    pub fn parse_str(raw: &str, yaml: bool, origin: &str) -> Result<Program> {
        let value = if yaml {
            let yaml_value = serde_yaml::from_str::<serde_yaml::Value>(raw).map_err(|err| {
                Error::Serialization(format!("failed parsing program yaml '{origin}': {err}"))
            })?;
            serde_json::to_value(yaml_value).map_err(|err| {
                Error::Serialization(format!(
                    "failed converting program yaml '{origin}' to json: {err}"
                ))
            })?
        } else {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|err| {
                Error::Serialization(format!("failed parsing program json '{origin}': {err}"))
            })?
        };

        let mut program = serde_json::from_value::<Program>(value).map_err(|err| {
            Error::Serialization(format!("invalid program definition '{origin}': {err}"))
        })?;
        if program.id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "program definition '{origin}' has no id"
            )));
        }
        for step in &mut program.steps {
            if step.program_id.is_empty() {
                step.program_id = program.id.clone();
            }
            if step.name.is_empty() {
                step.name = step.id.clone();
            }
        }
        Ok(program)
    }

    pub fn load_file(path: &Path) -> Result<Program> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Io(std::io::Error::new(
                err.kind(),
                format!("failed reading program file '{}': {err}", path.display()),
            ))
        })?;
        Self::parse_str(&raw, Self::is_yaml(path), &path.display().to_string())
    }

    /// Program files under `root`, sorted by path.
    pub fn discover(root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((root.to_path_buf(), 0usize));
        while let Some((current, depth)) = queue.pop_front() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %current.display(), "skipping unreadable directory: {err}");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if depth < MAX_DISCOVERY_DEPTH {
                        queue.push_back((path, depth + 1));
                    }
                    continue;
                }
                if path.is_file() && Self::has_program_extension(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    }

    /// Loads a single file, or every program file below a directory.
    pub fn load_path(path: &Path) -> Result<Vec<Program>> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "program path '{}' does not exist",
                path.display()
            )));
        }
        if path.is_dir() {
            Self::discover(path)
                .iter()
                .map(|file| Self::load_file(file))
                .collect()
        } else {
            Ok(vec![Self::load_file(path)?])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::types::{ActionType, ExecutionStrategy, StepType, TriggerType};

    const YAML: &str = r#"
id: welcome
name: Welcome journey
execution:
  strategy: parallel
  parallel_limit: 2
steps:
  - id: greet
    step_type: message
    action:
      type: send_message
      params:
        message: "Hi ${user.name}"
    next: [check]
  - id: check
    step_type: condition
    trigger:
      type: condition_based
      condition: "COUNT(orders) > 0"
    action:
      type: push_webhook
"#;

    #[test]
    fn parses_yaml_and_fills_step_ownership() {
        let program = ProgramLoader::parse_str(YAML, true, "inline").unwrap();
        assert_eq!(program.id, "welcome");
        assert_eq!(program.version, 1);
        assert_eq!(program.execution.strategy, ExecutionStrategy::Parallel);
        assert_eq!(program.steps.len(), 2);

        let check = program.step("check").unwrap();
        assert_eq!(check.program_id, "welcome");
        assert_eq!(check.name, "check");
        assert_eq!(check.step_type, StepType::Condition);
        assert_eq!(check.trigger.trigger_type, TriggerType::ConditionBased);
        assert_eq!(
            check.action.action_type,
            ActionType::Custom("push_webhook".to_owned())
        );
    }

    #[test]
    fn rejects_definitions_without_id() {
        let err = ProgramLoader::parse_str(r#"{"steps": []}"#, false, "inline").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn loads_directories_recursively_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("b.yaml"), YAML).unwrap();
        std::fs::write(nested.join("a.json"), r#"{"id": "nested", "steps": []}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let programs = ProgramLoader::load_path(dir.path()).unwrap();
        let ids: Vec<&str> = programs.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["welcome", "nested"]);
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = ProgramLoader::load_path(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
