use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::Error;
use crate::propagation::PropagationStrategy;

/// Options that control the [`ShardingPropagationPipeline`](crate::pipeline::ShardingPropagationPipeline).
///
/// Besides being constructed directly, options can be parsed from a whitespace-separated list of `key=value` pairs
/// that uses the kebab-case names of the fields (e.g., `"keep-sharding-rules=true conservative-propagation=1"`).
/// Fields that are not mentioned keep their default values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationOptions {
    /// If `true`, the sharding rules of all operations are kept in the output module. Otherwise, only custom rules
    /// (i.e., rules that were provided by the user) are kept.
    pub keep_sharding_rules: bool,

    /// Optional [`PathBuf`] to a directory in which to write a snapshot of the module after each pipeline stage.
    pub dump_directory: Option<PathBuf>,

    /// If `true`, sub-axes are never propagated and axes are only propagated to factors they evenly divide.
    pub conservative_propagation: bool,

    /// If `true`, the value each propagated axis originates from is recorded.
    pub debug_sharding_origins: bool,

    /// If `true`, every sharding change is recorded along with the value that caused it.
    pub debug_edge_source_sharding: bool,

    /// [`PropagationStrategy`] used to reconcile the shardings of each factor.
    pub propagation_strategy: PropagationStrategy,

    /// If `true`, each propagation run consists of one pass per op-priority heuristic. Otherwise, each run consists
    /// of a single pass in which all operations propagate in both directions.
    pub run_op_priority_propagation: bool,

    /// If `true`, collectives are inserted wherever an operand sharding differs from the sharding its operation
    /// expects. Otherwise, such mismatches are an error when both shardings are closed.
    pub enable_insert_explicit_collectives: bool,

    /// If `true`, all shardings of the output module are closed.
    pub close_shardings: bool,

    /// Number of operations a single propagation pass is expected to process at most. Passes that exceed it log a
    /// warning and still run until they reach a fixed point.
    pub max_worklist_iterations: usize,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            keep_sharding_rules: false,
            dump_directory: None,
            conservative_propagation: false,
            debug_sharding_origins: false,
            debug_edge_source_sharding: false,
            propagation_strategy: PropagationStrategy::Aggressive,
            run_op_priority_propagation: true,
            enable_insert_explicit_collectives: true,
            close_shardings: true,
            max_worklist_iterations: 100_000,
        }
    }
}

impl FromStr for PropagationOptions {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut options = Self::default();
        for pair in value.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| Error::InvalidOption {
                option: pair.to_string(),
                message: "expected a 'key=value' pair".to_string(),
            })?;
            match key {
                "keep-sharding-rules" => options.keep_sharding_rules = parse_bool(key, value)?,
                "dump-directory" => options.dump_directory = (!value.is_empty()).then(|| PathBuf::from(value)),
                "conservative-propagation" => options.conservative_propagation = parse_bool(key, value)?,
                "debug-sharding-origins" => options.debug_sharding_origins = parse_bool(key, value)?,
                "debug-edge-source-sharding" => options.debug_edge_source_sharding = parse_bool(key, value)?,
                "propagation-strategy" => options.propagation_strategy = value.parse()?,
                "run-op-priority-propagation" => options.run_op_priority_propagation = parse_bool(key, value)?,
                "enable-insert-explicit-collectives" => {
                    options.enable_insert_explicit_collectives = parse_bool(key, value)?
                }
                "close-shardings" => options.close_shardings = parse_bool(key, value)?,
                "max-worklist-iterations" => {
                    options.max_worklist_iterations = value.parse().map_err(|_| Error::InvalidOption {
                        option: key.to_string(),
                        message: format!("expected a non-negative integer, but got '{value}'"),
                    })?
                }
                _ => {
                    return Err(Error::InvalidOption { option: key.to_string(), message: "unknown option".to_string() });
                }
            }
        }
        Ok(options)
    }
}

impl FromStr for PropagationStrategy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "basic" => Ok(Self::Basic),
            "aggressive" => Ok(Self::Aggressive),
            _ => Err(Error::InvalidOption {
                option: "propagation-strategy".to_string(),
                message: format!("expected 'basic' or 'aggressive', but got '{value}'"),
            }),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::InvalidOption {
            option: key.to_string(),
            message: format!("expected 'true', 'false', '1', or '0', but got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_propagation_options_parsing() {
        let options = "keep-sharding-rules=true conservative-propagation=1  propagation-strategy=basic \
            dump-directory=/tmp/dumps max-worklist-iterations=10 close-shardings=0"
            .parse::<PropagationOptions>()
            .unwrap();
        assert_eq!(
            options,
            PropagationOptions {
                keep_sharding_rules: true,
                dump_directory: Some(PathBuf::from("/tmp/dumps")),
                conservative_propagation: true,
                propagation_strategy: PropagationStrategy::Basic,
                close_shardings: false,
                max_worklist_iterations: 10,
                ..PropagationOptions::default()
            },
        );
        assert_eq!("".parse::<PropagationOptions>().unwrap(), PropagationOptions::default());
    }

    #[test]
    fn test_invalid_propagation_options() {
        assert!(matches!(
            "keep-sharding-rules=yes".parse::<PropagationOptions>(),
            Err(Error::InvalidOption { option, .. }) if option == "keep-sharding-rules",
        ));
        assert!(matches!(
            "propagation-strategy=greedy".parse::<PropagationOptions>(),
            Err(Error::InvalidOption { option, .. }) if option == "propagation-strategy",
        ));
        assert!(matches!(
            "unknown-option=1".parse::<PropagationOptions>(),
            Err(Error::InvalidOption { message, .. }) if message == "unknown option",
        ));
        assert!(matches!(
            "keep-sharding-rules".parse::<PropagationOptions>(),
            Err(Error::InvalidOption { option, .. }) if option == "keep-sharding-rules",
        ));
    }
}
