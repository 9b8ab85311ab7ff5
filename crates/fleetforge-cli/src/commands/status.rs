use super::{
    colorize_status, json_pretty, make_rollout_client, ServerArgs, EXIT_PARTIAL_FAILURE,
    EXIT_SUCCESS,
};
use fleetforge_remote::{channel_status, reassign_latest, HawkbitClient, Reassignment};

pub fn run(channel: &str, reassign: bool, server: &ServerArgs, json: bool) -> Result<u8, String> {
    let client = make_rollout_client(server)?;
    if reassign {
        return run_reassign(&client, channel, json);
    }
    let targets = channel_status(&client, channel).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&targets)?);
        return Ok(EXIT_SUCCESS);
    }

    if targets.is_empty() {
        println!("no devices on channel '{channel}'");
        return Ok(EXIT_SUCCESS);
    }
    let mut attention = 0usize;
    for target in &targets {
        println!("{} ({})", target.controller_id, target.name);
        match &target.action {
            Some(action) => {
                if action.needs_attention() {
                    attention += 1;
                }
                println!(
                    "  action {} {} -> {}",
                    action.action_id,
                    colorize_status(&action.status),
                    action.distribution
                );
                if let Some(kind) = &action.latest_type {
                    println!(
                        "  latest: {} {}",
                        colorize_status(kind),
                        action.message.as_deref().unwrap_or("")
                    );
                }
            }
            None => println!("  no actions"),
        }
    }
    println!(
        "{} device(s), {attention} needing attention",
        targets.len()
    );
    Ok(EXIT_SUCCESS)
}

fn run_reassign(client: &HawkbitClient, channel: &str, json: bool) -> Result<u8, String> {
    let result = reassign_latest(client, channel).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&result)?);
        return Ok(outcome(&result));
    }
    for id in &result.reassigned {
        println!("{id}: assigned {}", result.distribution);
    }
    for (id, err) in &result.failed {
        println!("{id}: {} {err}", colorize_status("failed"));
    }
    println!(
        "{} device(s) reassigned, {} failed",
        result.reassigned.len(),
        result.failed.len()
    );
    Ok(outcome(&result))
}

fn outcome(result: &Reassignment) -> u8 {
    if result.failed.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL_FAILURE
    }
}
