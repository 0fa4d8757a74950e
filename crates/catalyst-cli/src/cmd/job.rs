use catalyst_core::messages::Origin;
use catalyst_core::model::Job;
use catalyst_core::ServiceConfig;
use clap::Subcommand;

use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum JobSubcommand {
    /// List jobs, newest first
    List,
    /// Show a job's status and output
    Show { id: String },
    /// Print a job's log (image pull output and script stderr)
    Log { id: String },
}

pub fn run(config: &ServiceConfig, subcmd: JobSubcommand, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(config)?;
    match subcmd {
        JobSubcommand::List => {
            let jobs = db.list_jobs()?;
            if json {
                return print_json(&jobs);
            }
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = jobs
                .iter()
                .map(|j| {
                    vec![
                        j.id.clone(),
                        j.automation.clone(),
                        j.status.to_string(),
                        describe_origin(&j.origin),
                        j.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ]
                })
                .collect();
            print_table(&["ID", "AUTOMATION", "STATUS", "ORIGIN", "CREATED"], &rows);
            Ok(())
        }
        JobSubcommand::Show { id } => {
            let job = db.job(&id)?;
            if json {
                return print_json(&job);
            }
            print_job(&job)
        }
        JobSubcommand::Log { id } => {
            let job = db.job(&id)?;
            if json {
                return print_json(&serde_json::json!({ "id": job.id, "log": job.log }));
            }
            print!("{}", job.log);
            Ok(())
        }
    }
}

fn describe_origin(origin: &Origin) -> String {
    match origin {
        Origin::Task(t) => format!("task {}/{}/{}", t.ticket_id, t.playbook_id, t.task_id),
        Origin::Artifact(a) => format!("artifact {}/{}", a.ticket_id, a.artifact),
        Origin::None => "-".to_string(),
    }
}

fn print_job(job: &Job) -> anyhow::Result<()> {
    println!("ID:         {}", job.id);
    println!("Automation: {}", job.automation);
    println!("Status:     {}", job.status);
    println!("Origin:     {}", describe_origin(&job.origin));
    if let Some(container) = &job.container {
        println!("Container:  {container}");
    }
    if let Some(error) = &job.error {
        println!("Error:      {error}");
    }
    println!("Payload:    {}", serde_json::to_string(&job.payload)?);
    if let Some(output) = &job.output {
        println!("Output:     {}", serde_json::to_string(output)?);
    }
    Ok(())
}
