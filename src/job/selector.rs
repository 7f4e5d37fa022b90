//! Resource selectors: how a job turns an agent's available pool into a request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::agent::resources::{Demand, Resource, ResourcePool, ResourceRequest};
use crate::store::Record;
use crate::types::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSelector {
    /// Job attributes named like pool entries are the request (`cpus: 2`).
    #[default]
    Attributes,
    /// A fixed request.
    Explicit { request: ResourceRequest },
    /// A fraction of each listed pool entry (every entry when empty), rounded down.
    Fraction {
        fraction: f64,
        #[serde(default)]
        resources: Vec<String>,
    },
}

impl ResourceSelector {
    pub fn evaluate(&self, job: &Record, available: &ResourcePool) -> Result<ResourceRequest> {
        match self {
            ResourceSelector::Attributes => job
                .attrs
                .iter()
                .filter_map(|(name, value)| {
                    available
                        .get(name)
                        .map(|resource| Ok((name.clone(), Demand::from_value(resource, value)?)))
                })
                .collect(),
            ResourceSelector::Explicit { request } => Ok(request.clone()),
            ResourceSelector::Fraction {
                fraction,
                resources,
            } => {
                if !(*fraction > 0.0 && *fraction <= 1.0) {
                    return Err(Error::validation(format!(
                        "resource fraction {} outside (0, 1]",
                        fraction
                    )));
                }
                let names: Vec<&String> = if resources.is_empty() {
                    available.keys().collect()
                } else {
                    resources.iter().collect()
                };
                let mut request = BTreeMap::new();
                for name in names {
                    let resource = available.get(name).ok_or_else(|| {
                        Error::invalid_resource(format!("resource {} missing", name))
                    })?;
                    request.insert(name.clone(), fraction_of(resource, *fraction));
                }
                Ok(request)
            }
        }
    }
}

fn fraction_of(resource: &Resource, fraction: f64) -> Demand {
    let share = |n: usize| (n as f64 * fraction).floor() as usize;
    match resource {
        Resource::Scalar(n) => Demand::Amount((*n as f64 * fraction).floor() as i64),
        Resource::Quantity(q) => Demand::Quantity(q * fraction),
        Resource::List(items) => Demand::Count(share(items.len())),
        Resource::Map(entries) => {
            Demand::Keys(entries.keys().take(share(entries.len())).cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Key;
    use serde_json::json;

    fn available() -> ResourcePool {
        serde_json::from_value(json!({"cpus": [0, 1, 2, 3], "ram": 10, "gpus": {"a": 1, "b": 2}}))
            .unwrap()
    }

    #[test]
    fn test_attributes_selector_picks_pool_names() {
        let job = Record::new(Key::timed("job", 1))
            .with("cpus", 2)
            .with("status", "queued")
            .with("ram", 4);
        let request = ResourceSelector::Attributes
            .evaluate(&job, &available())
            .unwrap();
        assert_eq!(request.len(), 2);
        assert_eq!(request["cpus"], Demand::Count(2));
        assert_eq!(request["ram"], Demand::Amount(4));
    }

    #[test]
    fn test_fraction_selector() {
        let job = Record::new(Key::timed("job", 1));
        let selector = ResourceSelector::Fraction {
            fraction: 0.5,
            resources: Vec::new(),
        };
        let request = selector.evaluate(&job, &available()).unwrap();
        assert_eq!(request["cpus"], Demand::Count(2));
        assert_eq!(request["ram"], Demand::Amount(5));
        assert_eq!(request["gpus"], Demand::Keys(vec!["a".to_string()]));

        let bad = ResourceSelector::Fraction {
            fraction: 1.5,
            resources: Vec::new(),
        };
        assert!(bad.evaluate(&job, &available()).is_err());
    }

    #[test]
    fn test_selector_serde_shape() {
        let selector: ResourceSelector =
            serde_json::from_value(json!({"kind": "explicit", "request": {"cpus": {"count": 1}}}))
                .unwrap();
        assert_eq!(
            selector,
            ResourceSelector::Explicit {
                request: ResourceRequest::from([("cpus".to_string(), Demand::Count(1))])
            }
        );
    }
}
