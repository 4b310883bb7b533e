//! Step File Loading
//!
//! Reads and writes step trees as YAML (default) or JSON (`.json`).

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::model::Step;

/// Errors raised while reading or writing a step file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read step file '{}': {source}. Check that the file exists and is readable.", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write step file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse step YAML in '{}': {source}", .path.display())]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Failed to parse step JSON in '{}': {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Loads a step tree from a file.
///
/// The tree is returned as written; call
/// [`validate`](super::validator::validate) before running it.
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::workflow::{load_step, validate};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut step = load_step("workflow.yaml")?;
///     validate(&mut step)?;
///     println!("Loaded {} steps", step.tree_size());
///     Ok(())
/// }
/// ```
pub fn load_step(path: impl AsRef<Path>) -> Result<Step, ParseError> {
    let path = path.as_ref();
    info!("Loading step tree from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Step file loaded ({} bytes)", content.len());

    if is_json(path) {
        serde_json::from_str(&content).map_err(|source| ParseError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Writes a step tree to a file in the format implied by its extension.
pub fn save_step(step: &Step, path: impl AsRef<Path>) -> Result<(), ParseError> {
    let path = path.as_ref();

    let content = if is_json(path) {
        serde_json::to_string_pretty(step).map_err(|source| ParseError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml::to_string(step).map_err(|source| ParseError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    fs::write(path, content).map_err(|source| ParseError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved step tree to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepStatus;
    use tempfile::tempdir;

    const YAML: &str = r#"
runId: 3
runName: nightly
stepId: 1
stepName: root
urls:
  - http://peer:5000/run
subSteps:
  - runId: 3
    runName: nightly
    stepId: 2
    stepName: extract
    targetAssembly: extract.sh
    targetType: Extract
    dependencies:
      - tools/extract.sh
"#;

    #[test]
    fn test_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.yaml");
        fs::write(&path, YAML).unwrap();

        let step = load_step(&path).unwrap();
        assert_eq!(step.run_name, "nightly");
        assert_eq!(step.sub_steps.len(), 1);
        assert_eq!(step.sub_steps[0].dependencies, vec!["tools/extract.sh"]);
        assert_eq!(step.status, StepStatus::NotStarted);
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        fs::write(
            &path,
            r#"{"runId":1,"runName":"r","stepId":1,"stepName":"s","status":"Complete"}"#,
        )
        .unwrap();

        let step = load_step(&path).unwrap();
        assert_eq!(step.status, StepStatus::Complete);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_step("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(ParseError::Read { .. })));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "runName: [unclosed").unwrap();

        let err = load_step(&path).unwrap_err();
        assert!(matches!(err, ParseError::Yaml { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_save_then_load_keeps_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.yaml");

        let step = Step::new(5, "run", 1, "root")
            .with_urls(vec!["http://peer".to_string()])
            .with_transition_step(Step::new(5, "run", 2, "next").with_capability("a", "B"));

        save_step(&step, &path).unwrap();
        assert_eq!(load_step(&path).unwrap(), step);
    }
}
