use std::path::{Path, PathBuf};

use anyhow::Context;
use catalyst_core::model::{Automation, AutomationType};
use catalyst_core::ServiceConfig;
use clap::Subcommand;

use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum AutomationSubcommand {
    /// Add or replace an automation
    Add {
        id: String,
        /// Container image the script runs in
        #[arg(long)]
        image: String,
        /// Script file; must start with a shebang line
        #[arg(long, value_name = "FILE")]
        script: PathBuf,
        /// JSON schema of the payload
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,
        /// Where it can be triggered (repeatable: global, artifact, playbook)
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<AutomationType>,
    },
    /// List automations
    List,
    /// Show one automation, including its script
    Show { id: String },
}

pub fn run(config: &ServiceConfig, subcmd: AutomationSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AutomationSubcommand::Add {
            id,
            image,
            script,
            schema,
            types,
        } => add(config, id, image, &script, schema.as_deref(), types, json),
        AutomationSubcommand::List => list(config, json),
        AutomationSubcommand::Show { id } => show(config, &id, json),
    }
}

fn add(
    config: &ServiceConfig,
    id: String,
    image: String,
    script: &Path,
    schema: Option<&Path>,
    types: Vec<AutomationType>,
    json: bool,
) -> anyhow::Result<()> {
    let script = std::fs::read_to_string(script)
        .with_context(|| format!("reading script {}", script.display()))?;
    let schema = match schema {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading schema {}", path.display()))?;
            Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("{} is not valid JSON", path.display()))?,
            )
        }
        None => None,
    };
    let automation = Automation {
        id,
        image,
        script,
        schema,
        types,
    };

    super::open_db(config)?.put_automation(&automation)?;

    if json {
        print_json(&automation)?;
    } else {
        println!("Saved automation '{}' ({})", automation.id, automation.image);
    }
    Ok(())
}

fn list(config: &ServiceConfig, json: bool) -> anyhow::Result<()> {
    let automations = super::open_db(config)?.list_automations()?;
    if json {
        return print_json(&automations);
    }
    if automations.is_empty() {
        println!("No automations.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = automations
        .iter()
        .map(|a| {
            let types: Vec<&str> = a.types.iter().map(AutomationType::as_str).collect();
            vec![a.id.clone(), a.image.clone(), types.join(",")]
        })
        .collect();
    print_table(&["ID", "IMAGE", "TYPES"], &rows);
    Ok(())
}

fn show(config: &ServiceConfig, id: &str, json: bool) -> anyhow::Result<()> {
    let automation = super::open_db(config)?.automation(id)?;
    if json {
        return print_json(&automation);
    }
    println!("ID:     {}", automation.id);
    println!("Image:  {}", automation.image);
    if let Some(schema) = &automation.schema {
        println!("Schema: {schema}");
    }
    println!();
    print!("{}", automation.script);
    if !automation.script.ends_with('\n') {
        println!();
    }
    Ok(())
}
