//! `strata validate` command - Parse a recipe and print its step plan.

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use strata_core::{Step, StepKind};
use strata_runtime::{Instruction, Recipe};

#[derive(Args)]
pub struct ValidateArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Path to the recipe (default: <PATH>/Recipe, then <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// One planned instruction.
#[derive(Debug, Serialize)]
struct PlanEntry {
    /// Step index, absent for bindings and metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<StepKind>,
    instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<Step>,
}

#[derive(Debug, Serialize)]
struct Plan {
    base: String,
    steps: usize,
    entries: Vec<PlanEntry>,
}

pub async fn execute(args: ValidateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path);
    let recipe_path = super::recipe_path(&context_dir, args.file.as_deref());
    let recipe = Recipe::from_file(&recipe_path)?;
    let plan = build_plan(&recipe);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("FROM {}", plan.base);
    for entry in &plan.entries {
        match (entry.index, entry.kind) {
            (Some(index), Some(kind)) => {
                println!("  [{}] {:<11} {}", index, kind.to_string(), entry.instruction)
            }
            _ => println!("      {:<11} {}", "", entry.instruction),
        }
    }
    println!("{} steps", plan.steps);
    Ok(())
}

fn build_plan(recipe: &Recipe) -> Plan {
    let mut entries = Vec::new();
    let mut index = 0;

    for instruction in &recipe.instructions {
        let entry = match instruction {
            Instruction::From { .. } => continue,
            Instruction::Step(step) => {
                let entry = PlanEntry {
                    index: Some(index),
                    kind: Some(step.kind()),
                    instruction: step.describe(),
                    step: Some(step.clone()),
                };
                index += 1;
                entry
            }
            other => PlanEntry {
                index: None,
                kind: None,
                instruction: describe(other),
                step: None,
            },
        };
        entries.push(entry);
    }

    Plan {
        base: recipe.base().to_string(),
        steps: index,
        entries,
    }
}

fn describe(instruction: &Instruction) -> String {
    match instruction {
        Instruction::From { image } => format!("FROM {}", image),
        Instruction::Arg { name, default } => match default {
            Some(d) => format!("ARG {}={}", name, d),
            None => format!("ARG {}", name),
        },
        Instruction::Step(step) => step.describe(),
        Instruction::Env(binding) => format!("ENV {}", binding),
        Instruction::Workdir { path } => format!("WORKDIR {}", path),
        Instruction::Label { key, value } => format!("LABEL {}={}", key, value),
        Instruction::Cmd { exec } => format!("CMD {:?}", exec),
        Instruction::Entrypoint { exec } => format!("ENTRYPOINT {:?}", exec),
        Instruction::Expose { port } => format!("EXPOSE {}", port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_indexes_steps_only() {
        let recipe = Recipe::parse(
            "ARG V=1\nFROM ubuntu:22.04\nENV A=1\nCOPY a.sh /a\nWORKDIR /app\nRUN make\n",
        )
        .unwrap();
        let plan = build_plan(&recipe);

        assert_eq!(plan.base, "ubuntu:22.04");
        assert_eq!(plan.steps, 2);
        let indexed: Vec<_> = plan
            .entries
            .iter()
            .filter_map(|e| e.index.map(|i| (i, e.instruction.clone())))
            .collect();
        assert_eq!(
            indexed,
            vec![(0, "COPY a.sh /a".to_string()), (1, "RUN make".to_string())]
        );
        assert_eq!(plan.entries[0].instruction, "ARG V=1");
        assert_eq!(plan.entries[1].instruction, "ENV A=1");
    }

    #[test]
    fn test_plan_json_shape() {
        let recipe = Recipe::parse("FROM scratch\nRUN [\"make\", \"install\"]\n").unwrap();
        let json = serde_json::to_value(build_plan(&recipe)).unwrap();
        assert_eq!(json["steps"], 1);
        assert_eq!(json["entries"][0]["kind"], "run-command");
        assert_eq!(json["entries"][0]["step"]["kind"], "run-command");
    }
}
