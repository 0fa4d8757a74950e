use std::sync::Arc;

use anyhow::{bail, Context};
use catalyst_automation::{JobCoordinator, PlatformSecrets, Reporter, ResultRouter};
use catalyst_core::messages::{JobMsg, Origin, ScriptMessage};
use catalyst_core::{Bus, ServiceConfig};
use catalyst_sandbox::{CancellationToken, ContainerRuntime, DockerEngine};

use crate::output::print_json;

pub struct RunArgs {
    pub automation: String,
    pub payload: String,
    pub task: Option<String>,
    pub artifact: Option<String>,
    pub id: Option<String>,
}

/// `TICKET/PLAYBOOK/TASK` or `TICKET/ARTIFACT`; artifact names may contain `/`.
fn parse_origin(task: Option<&str>, artifact: Option<&str>) -> anyhow::Result<Origin> {
    if let Some(task) = task {
        let parts: Vec<&str> = task.splitn(3, '/').collect();
        let [ticket, playbook, task_id] = parts.as_slice() else {
            bail!("--task must look like TICKET/PLAYBOOK/TASK, got '{task}'");
        };
        let ticket: i64 = ticket
            .parse()
            .with_context(|| format!("ticket ID '{ticket}' is not a number"))?;
        return Ok(Origin::task(ticket, *playbook, *task_id));
    }
    if let Some(artifact) = artifact {
        let Some((ticket, name)) = artifact.split_once('/') else {
            bail!("--artifact must look like TICKET/ARTIFACT, got '{artifact}'");
        };
        let ticket: i64 = ticket
            .parse()
            .with_context(|| format!("ticket ID '{ticket}' is not a number"))?;
        return Ok(Origin::artifact(ticket, name));
    }
    Ok(Origin::None)
}

pub fn run(config: &ServiceConfig, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    let origin = parse_origin(args.task.as_deref(), args.artifact.as_deref())?;

    let db = super::open_db(config)?;
    // Fail before touching docker when the automation does not exist.
    db.automation(&args.automation)?;

    let msg = JobMsg {
        id: args.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        automation: args.automation,
        origin,
        message: ScriptMessage {
            payload,
            ..Default::default()
        },
    };

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let bus = Arc::new(Bus::new(&config.bus));
        let engine = DockerEngine::connect().context("connecting to docker")?;
        let runtime = ContainerRuntime::new(
            Arc::new(engine),
            config.network.clone(),
            config.timeouts.clone(),
        );
        let store = Arc::new(db.clone());
        let coordinator = JobCoordinator::new(
            Arc::clone(&bus),
            store.clone(),
            store.clone(),
            Arc::new(runtime),
            PlatformSecrets {
                api_url: config.api_url.clone(),
                api_key: config.api_key.clone(),
            },
            CancellationToken::new(),
        );
        let Some(result) = coordinator.handle(&msg).await else {
            let reason = db
                .job(&msg.id)
                .ok()
                .and_then(|j| j.error)
                .unwrap_or_else(|| "job was not started".to_string());
            bail!("job {} failed: {reason}", msg.id);
        };
        ResultRouter::new(store.clone(), store, Reporter::new(bus))
            .handle(&result)
            .await;
        Ok::<_, anyhow::Error>(result)
    })?;

    if json {
        print_json(&result)?;
    } else {
        println!("Job {} finished", msg.id);
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Ok(())
}
