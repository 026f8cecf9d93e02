// CLI runner commands: runners, config set, config show

use reqwest::Client;

use super::{base_url, error_from_response, handle_request_error, parse_key_values};
use crate::models::{ConfigVar, Runner, TargetRunner};

/// Build the var list for `jobd config set`, every var targeted alike.
pub fn build_config_vars(vars: &[String], runner: Option<&str>) -> anyhow::Result<Vec<ConfigVar>> {
    let target = match runner {
        Some(id) => TargetRunner::Id(id.to_string()),
        None => TargetRunner::Any,
    };
    let parsed = parse_key_values(vars).map_err(|e| anyhow::anyhow!(e))?;
    Ok(parsed
        .into_iter()
        .map(|(name, value)| ConfigVar {
            name,
            value,
            target: target.clone(),
        })
        .collect())
}

/// jobd runners
pub async fn cmd_runners(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/runners", base_url(host, port));
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let runners: Vec<Runner> = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runners)?);
        return Ok(());
    }

    if runners.is_empty() {
        println!("No runners connected.");
        return Ok(());
    }

    println!("{:<30} {:<10} LABELS", "ID", "BY-ID-ONLY");
    for runner in &runners {
        let labels: Vec<String> = runner
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{:<30} {:<10} {}",
            runner.id,
            runner.by_id_only,
            labels.join(",")
        );
    }
    Ok(())
}

/// jobd config set
pub async fn cmd_config_set(
    host: &str,
    port: u16,
    vars: &[String],
    runner: Option<&str>,
) -> anyhow::Result<()> {
    let config_vars = build_config_vars(vars, runner)?;

    let client = Client::new();
    let url = format!("{}/api/config", base_url(host, port));
    let response = client
        .put(&url)
        .json(&config_vars)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    println!("Set {} config vars.", config_vars.len());
    Ok(())
}

/// jobd config show
pub async fn cmd_config_show(host: &str, port: u16, runner: Option<&str>) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/config", base_url(host, port));
    let mut request = client.get(&url);
    if let Some(id) = runner {
        request = request.query(&[("runner_id", id)]);
    }

    let response = request
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let vars: Vec<ConfigVar> = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if vars.is_empty() {
        println!("No config vars.");
    }
    for var in &vars {
        println!("{}={}  ({})", var.name, var.value, var.target);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_vars_targets_runner() {
        let vars = vec!["A=1".to_string(), "B=two".to_string()];
        let built = build_config_vars(&vars, Some("r1")).expect("vars");
        assert_eq!(built.len(), 2);
        assert_eq!(built[0].name, "A");
        assert_eq!(built[1].value, "two");
        assert!(built
            .iter()
            .all(|v| v.target == TargetRunner::Id("r1".to_string())));
    }

    #[test]
    fn test_build_config_vars_rejects_bad_pair() {
        assert!(build_config_vars(&["novalue".to_string()], None).is_err());
    }
}
