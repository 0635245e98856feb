// Module: Loader
// Parses the task and proxy files handed to the CLI.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::proxies::ProxyPool;
use crate::scheduler::Tasks;

/// Loads a task list: a JSON object (`key → params`) admits tasks, a JSON
/// array of strings replays previously admitted ones.
pub fn load_tasks_from_file<P: AsRef<Path>>(path: P) -> Result<Tasks> {
    let content = fs::read_to_string(&path).context("Failed to read tasks file")?;
    let value: Value = serde_json::from_str(&content).context("Failed to parse tasks JSON")?;
    Tasks::from_json(value)
}

/// Loads a proxy pool: a JSON array of proxy URLs becomes the wildcard
/// bucket, a JSON object of `country → [urls]` becomes a bucketed pool.
pub fn load_proxies_from_file<P: AsRef<Path>>(path: P) -> Result<ProxyPool> {
    let content = fs::read_to_string(&path).context("Failed to read proxies file")?;
    let value: Value = serde_json::from_str(&content).context("Failed to parse proxies JSON")?;

    match value {
        Value::Array(entries) => {
            let mut proxies = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::String(url) = entry else {
                    bail!("proxy list entries must be strings");
                };
                proxies.push(url);
            }
            Ok(ProxyPool::from_list(proxies))
        }
        Value::Object(map) => {
            let mut buckets: HashMap<String, Vec<String>> = HashMap::new();
            for (country, entries) in map {
                let Value::Array(entries) = entries else {
                    bail!("proxies for country '{country}' must be an array");
                };
                let mut proxies = Vec::with_capacity(entries.len());
                for entry in entries {
                    let Value::String(url) = entry else {
                        bail!("proxy list entries must be strings");
                    };
                    proxies.push(url);
                }
                buckets.insert(country, proxies);
            }
            Ok(ProxyPool::from_country_map(buckets))
        }
        _ => bail!("proxies file must be a JSON array or object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxies::ProxyProvider;

    #[test]
    fn test_load_tasks_admission_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"{"g": {"url": "http://a/"}}"#).unwrap();

        let tasks = load_tasks_from_file(&path).unwrap();
        assert!(matches!(tasks, Tasks::Admit(ref items) if items.len() == 1));
    }

    #[test]
    fn test_load_tasks_replay_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"["g", "b"]"#).unwrap();

        let tasks = load_tasks_from_file(&path).unwrap();
        assert!(matches!(tasks, Tasks::Replay(ref keys) if keys.len() == 2));
    }

    #[test]
    fn test_load_tasks_rejects_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "42").unwrap();
        assert!(load_tasks_from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_load_proxies_list_and_map() {
        let dir = tempfile::tempdir().unwrap();

        let list_path = dir.path().join("list.json");
        fs::write(&list_path, r#"["http://p1:8080"]"#).unwrap();
        let pool = load_proxies_from_file(&list_path).unwrap();
        assert_eq!(
            pool.get_one_proxy(None).await,
            Some("http://p1:8080".to_string())
        );

        let map_path = dir.path().join("map.json");
        fs::write(&map_path, r#"{"de": ["http://de1:8080"]}"#).unwrap();
        let pool = load_proxies_from_file(&map_path).unwrap();
        assert_eq!(
            pool.get_one_proxy(Some("de")).await,
            Some("http://de1:8080".to_string())
        );
    }
}
