//! Resource pools and the split/merge partitioning used to reserve them.
//!
//! A pool maps resource names to one of three shapes:
//! - scalar counts (`cpus: 8`) or fractional quantities (`memory: 7.5`)
//! - ordered lists of identifiable units (`gpus: [0, 1, 2, 3]`)
//! - key→value mappings (`devices: {"0": "A100", "1": "A100"}`)
//!
//! [`split`] carves a partition out of a pool and [`merge`] puts it back
//! exactly, so an agent's available pool plus everything reserved by its
//! running work always adds up to its total allocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::store::values_equal;
use crate::types::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resource {
    Scalar(i64),
    Quantity(f64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Resource {
    fn kind(&self) -> &'static str {
        match self {
            Resource::Scalar(_) => "scalar",
            Resource::Quantity(_) => "quantity",
            Resource::List(_) => "list",
            Resource::Map(_) => "map",
        }
    }

    /// Number of units held: the scalar itself, or the element count.
    pub fn size(&self) -> usize {
        match self {
            Resource::Scalar(n) => usize::try_from(*n).unwrap_or(0),
            Resource::Quantity(q) => q.max(0.0) as usize,
            Resource::List(items) => items.len(),
            Resource::Map(entries) => entries.len(),
        }
    }
}

pub type ResourcePool = BTreeMap<String, Resource>;

/// How much of one resource a job wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Demand {
    /// Subtract from a scalar.
    Amount(i64),
    /// Subtract from a fractional quantity.
    Quantity(f64),
    /// Take the first N elements of a list, or the first N keys of a map.
    Count(usize),
    /// Take exactly these list elements.
    Named(Vec<Value>),
    /// Take these map keys.
    Keys(Vec<String>),
}

impl Demand {
    /// Interpret a plain JSON value against the shape of the resource it targets.
    pub fn from_value(resource: &Resource, value: &Value) -> Result<Self> {
        let demand = match (resource, value) {
            (Resource::Scalar(_), v) => v.as_i64().map(Demand::Amount),
            (Resource::Quantity(_), v) => v.as_f64().map(Demand::Quantity),
            (Resource::List(_), Value::Array(items)) => Some(Demand::Named(items.clone())),
            (Resource::List(_), v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Demand::Count),
            (Resource::Map(_), Value::Array(items)) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Demand::Keys),
            (Resource::Map(_), Value::String(key)) => Some(Demand::Keys(vec![key.clone()])),
            (Resource::Map(_), v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .map(Demand::Count),
            _ => None,
        };
        demand.ok_or_else(|| {
            Error::invalid_resource(format!(
                "cannot request {} from a {} resource",
                value,
                resource.kind()
            ))
        })
    }
}

pub type ResourceRequest = BTreeMap<String, Demand>;

/// Carve `request` out of `pool`, returning `(remaining, partition)`.
pub fn split(pool: &ResourcePool, request: &ResourceRequest) -> Result<(ResourcePool, ResourcePool)> {
    let mut left = pool.clone();
    let mut right = ResourcePool::new();

    for (name, demand) in request {
        let have = left
            .get_mut(name)
            .ok_or_else(|| Error::invalid_resource(format!("resource {} missing", name)))?;
        let taken = match (have, demand) {
            (Resource::Scalar(n), Demand::Amount(amount)) => {
                if *amount < 0 || *amount > *n {
                    return Err(Error::invalid_resource(format!(
                        "need {} but only had {} for {}",
                        amount, n, name
                    )));
                }
                *n -= amount;
                Resource::Scalar(*amount)
            }
            (Resource::Quantity(q), Demand::Quantity(amount)) => take_quantity(q, *amount, name)?,
            (Resource::Quantity(q), Demand::Amount(amount)) => {
                take_quantity(q, *amount as f64, name)?
            }
            (Resource::List(items), Demand::Count(count)) => {
                if *count > items.len() {
                    return Err(Error::invalid_resource(format!(
                        "need {} but only had {} for {}",
                        count,
                        items.len(),
                        name
                    )));
                }
                Resource::List(items.drain(..*count).collect())
            }
            (Resource::List(items), Demand::Named(wanted)) => {
                let mut taken = Vec::with_capacity(wanted.len());
                for value in wanted {
                    let index = items
                        .iter()
                        .position(|i| values_equal(i, value))
                        .ok_or_else(|| {
                            Error::invalid_resource(format!("{} not available in {}", value, name))
                        })?;
                    taken.push(items.remove(index));
                }
                Resource::List(taken)
            }
            (Resource::Map(entries), Demand::Count(count)) => {
                if *count > entries.len() {
                    return Err(Error::invalid_resource(format!(
                        "need {} but only had {} for {}",
                        count,
                        entries.len(),
                        name
                    )));
                }
                let keys: Vec<String> = entries.keys().take(*count).cloned().collect();
                let mut taken = BTreeMap::new();
                for key in keys {
                    if let Some(value) = entries.remove(&key) {
                        taken.insert(key, value);
                    }
                }
                Resource::Map(taken)
            }
            (Resource::Map(entries), Demand::Keys(keys)) => {
                let mut taken = BTreeMap::new();
                for key in keys {
                    let value = entries.remove(key).ok_or_else(|| {
                        Error::invalid_resource(format!("{} not available in {}", key, name))
                    })?;
                    taken.insert(key.clone(), value);
                }
                Resource::Map(taken)
            }
            (have, demand) => {
                return Err(Error::invalid_resource(format!(
                    "{:?} does not apply to {} resource {}",
                    demand,
                    have.kind(),
                    name
                )))
            }
        };
        right.insert(name.clone(), taken);
    }

    Ok((left, right))
}

fn take_quantity(have: &mut f64, amount: f64, name: &str) -> Result<Resource> {
    if !(0.0..=*have).contains(&amount) {
        return Err(Error::invalid_resource(format!(
            "need {} but only had {} for {}",
            amount, have, name
        )));
    }
    *have -= amount;
    Ok(Resource::Quantity(amount))
}

/// Return `partition` to `pool`. List elements are put back in the order
/// they have in `order` (the total allocation).
pub fn merge(pool: &ResourcePool, partition: &ResourcePool, order: &ResourcePool) -> Result<ResourcePool> {
    let mut merged = pool.clone();

    for (name, returned) in partition {
        let Some(have) = merged.get_mut(name) else {
            merged.insert(name.clone(), returned.clone());
            continue;
        };
        match (have, returned) {
            (Resource::Scalar(n), Resource::Scalar(m)) => {
                *n = n.checked_add(*m).ok_or_else(|| {
                    Error::invalid_resource(format!("merging {} into {} overflows {}", m, n, name))
                })?;
            }
            (Resource::Quantity(q), Resource::Quantity(r)) => *q += r,
            (Resource::List(items), Resource::List(back)) => {
                items.extend(back.iter().cloned());
                if let Some(Resource::List(reference)) = order.get(name) {
                    let rank = |v: &Value| {
                        reference
                            .iter()
                            .position(|r| values_equal(r, v))
                            .unwrap_or(usize::MAX)
                    };
                    items.sort_by_key(|v| rank(v));
                }
            }
            (Resource::Map(entries), Resource::Map(back)) => {
                entries.extend(back.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            (have, returned) => {
                return Err(Error::invalid_resource(format!(
                    "cannot merge {} into {} resource {}",
                    returned.kind(),
                    have.kind(),
                    name
                )))
            }
        }
    }

    Ok(merged)
}

/// An agent's total allocation and the part of it not reserved by work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResources {
    total: ResourcePool,
    available: ResourcePool,
}

impl AgentResources {
    pub fn new(total: ResourcePool) -> Self {
        Self {
            available: total.clone(),
            total,
        }
    }

    pub fn total(&self) -> &ResourcePool {
        &self.total
    }

    pub fn available(&self) -> &ResourcePool {
        &self.available
    }

    /// Reserve a request; the pool is untouched on failure.
    pub fn reserve(&mut self, request: &ResourceRequest) -> Result<ResourcePool> {
        let (left, partition) = split(&self.available, request)?;
        self.available = left;
        Ok(partition)
    }

    /// Give a reservation back.
    pub fn restore(&mut self, partition: &ResourcePool) -> Result<()> {
        self.available = merge(&self.available, partition, &self.total)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn pool() -> ResourcePool {
        serde_json::from_value(json!({
            "cpus": [0, 1, 2, 3],
            "ram": 64,
            "gpus": {"0": "A100", "1": "V100"}
        }))
        .unwrap()
    }

    #[test]
    fn test_pool_shapes_deserialize() {
        let pool = pool();
        assert_eq!(pool["ram"], Resource::Scalar(64));
        assert_eq!(pool["cpus"].size(), 4);
        assert!(matches!(pool["gpus"], Resource::Map(_)));
    }

    #[test]
    fn test_split_count_takes_first_elements() {
        let request = ResourceRequest::from([("cpus".to_string(), Demand::Count(2))]);
        let (left, right) = split(&pool(), &request).unwrap();
        assert_eq!(left["cpus"], Resource::List(vec![json!(2), json!(3)]));
        assert_eq!(right["cpus"], Resource::List(vec![json!(0), json!(1)]));
    }

    #[test]
    fn test_split_named_and_keys() {
        let request = ResourceRequest::from([
            ("cpus".to_string(), Demand::Named(vec![json!(3), json!(1)])),
            ("gpus".to_string(), Demand::Keys(vec!["1".to_string()])),
            ("ram".to_string(), Demand::Amount(16)),
        ]);
        let (left, right) = split(&pool(), &request).unwrap();
        assert_eq!(left["cpus"], Resource::List(vec![json!(0), json!(2)]));
        assert_eq!(right["cpus"], Resource::List(vec![json!(3), json!(1)]));
        assert_eq!(left["ram"], Resource::Scalar(48));
        assert_eq!(right["gpus"].size(), 1);
        assert_eq!(left["gpus"].size(), 1);
    }

    #[test]
    fn test_split_failures() {
        let short = ResourceRequest::from([("cpus".to_string(), Demand::Count(5))]);
        assert!(matches!(split(&pool(), &short), Err(Error::InvalidResource(_))));

        let unknown = ResourceRequest::from([("tpus".to_string(), Demand::Count(1))]);
        assert!(split(&pool(), &unknown).is_err());

        let mismatch = ResourceRequest::from([("ram".to_string(), Demand::Count(1))]);
        assert!(split(&pool(), &mismatch).is_err());

        let overdraw = ResourceRequest::from([("ram".to_string(), Demand::Amount(65))]);
        assert!(split(&pool(), &overdraw).is_err());
    }

    #[test]
    fn test_count_from_a_map_takes_first_keys() {
        let pool = pool();
        let demand = Demand::from_value(&pool["gpus"], &json!(1)).unwrap();
        assert_eq!(demand, Demand::Count(1));
        let request = ResourceRequest::from([("gpus".to_string(), demand)]);
        let (left, right) = split(&pool, &request).unwrap();
        assert_eq!(right["gpus"], Resource::Map(BTreeMap::from([("0".to_string(), json!("A100"))])));
        assert_eq!(left["gpus"], Resource::Map(BTreeMap::from([("1".to_string(), json!("V100"))])));
        assert_eq!(merge(&left, &right, &pool).unwrap(), pool);

        let short = ResourceRequest::from([("gpus".to_string(), Demand::Count(3))]);
        assert!(split(&pool, &short).is_err());
    }

    #[test]
    fn test_fractional_quantities() {
        let pool: ResourcePool = serde_json::from_value(json!({"memory": 7.5, "cpus": 2})).unwrap();
        assert_eq!(pool["memory"], Resource::Quantity(7.5));
        assert_eq!(pool["cpus"], Resource::Scalar(2));

        let demand = Demand::from_value(&pool["memory"], &json!(2.5)).unwrap();
        let request = ResourceRequest::from([("memory".to_string(), demand)]);
        let (left, right) = split(&pool, &request).unwrap();
        assert_eq!(left["memory"], Resource::Quantity(5.0));
        assert_eq!(right["memory"], Resource::Quantity(2.5));
        assert_eq!(merge(&left, &right, &pool).unwrap(), pool);

        let overdraw = ResourceRequest::from([("memory".to_string(), Demand::Quantity(8.0))]);
        assert!(split(&pool, &overdraw).is_err());
        assert!(Demand::from_value(&pool["cpus"], &json!(0.5)).is_err());
    }

    #[test]
    fn test_merge_overflow_is_an_error() {
        let pool = ResourcePool::from([("ram".to_string(), Resource::Scalar(i64::MAX))]);
        let partition = ResourcePool::from([("ram".to_string(), Resource::Scalar(1))]);
        assert!(matches!(
            merge(&pool, &partition, &pool),
            Err(Error::InvalidResource(_))
        ));
    }

    #[test]
    fn test_merge_restores_list_order() {
        let total = pool();
        let mut resources = AgentResources::new(total.clone());
        let a = resources
            .reserve(&ResourceRequest::from([("cpus".to_string(), Demand::Count(1))]))
            .unwrap();
        let b = resources
            .reserve(&ResourceRequest::from([("cpus".to_string(), Demand::Count(2))]))
            .unwrap();
        resources.restore(&a).unwrap();
        resources.restore(&b).unwrap();
        assert_eq!(resources.available(), &total);
    }

    #[test]
    fn test_demand_from_value() {
        let pool = pool();
        assert_eq!(
            Demand::from_value(&pool["cpus"], &json!(2)).unwrap(),
            Demand::Count(2)
        );
        assert_eq!(
            Demand::from_value(&pool["cpus"], &json!([1])).unwrap(),
            Demand::Named(vec![json!(1)])
        );
        assert_eq!(
            Demand::from_value(&pool["ram"], &json!(8)).unwrap(),
            Demand::Amount(8)
        );
        assert_eq!(
            Demand::from_value(&pool["gpus"], &json!("0")).unwrap(),
            Demand::Keys(vec!["0".to_string()])
        );
        assert!(Demand::from_value(&pool["ram"], &json!("x")).is_err());
    }

    fn arb_case() -> impl Strategy<Value = (ResourcePool, ResourceRequest)> {
        (0i64..100, 0usize..8, 0usize..6).prop_flat_map(|(ram, list_len, map_len)| {
            (
                0..=ram,
                0..=list_len,
                proptest::collection::vec(any::<bool>(), list_len),
                proptest::collection::vec(any::<bool>(), map_len),
                any::<bool>(),
            )
                .prop_map(move |(amount, count, pick_list, pick_map, by_name)| {
                    let list: Vec<Value> = (0..list_len).map(|i| json!(i)).collect();
                    let map: BTreeMap<String, Value> =
                        (0..map_len).map(|i| (format!("k{}", i), json!(i))).collect();
                    let pool = ResourcePool::from([
                        ("ram".to_string(), Resource::Scalar(ram)),
                        ("cpus".to_string(), Resource::List(list.clone())),
                        ("gpus".to_string(), Resource::Map(map.clone())),
                    ]);
                    let list_demand = if by_name {
                        Demand::Named(
                            list.iter()
                                .zip(&pick_list)
                                .filter(|(_, pick)| **pick)
                                .map(|(v, _)| v.clone())
                                .collect(),
                        )
                    } else {
                        Demand::Count(count)
                    };
                    let keys = map
                        .keys()
                        .zip(&pick_map)
                        .filter(|(_, pick)| **pick)
                        .map(|(k, _)| k.clone())
                        .collect();
                    let request = ResourceRequest::from([
                        ("ram".to_string(), Demand::Amount(amount)),
                        ("cpus".to_string(), list_demand),
                        ("gpus".to_string(), Demand::Keys(keys)),
                    ]);
                    (pool, request)
                })
        })
    }

    proptest! {
        #[test]
        fn prop_merge_inverts_split((pool, request) in arb_case()) {
            let (left, partition) = split(&pool, &request).unwrap();
            let merged = merge(&left, &partition, &pool).unwrap();
            prop_assert_eq!(merged, pool);
        }

        #[test]
        fn prop_available_plus_reserved_is_total((pool, request) in arb_case()) {
            let mut resources = AgentResources::new(pool.clone());
            let first = resources.reserve(&request).unwrap();
            // A second identical request may or may not fit; either way the pool is consistent.
            let second = resources.reserve(&request).ok();
            if let Some(second) = second {
                resources.restore(&second).unwrap();
            }
            resources.restore(&first).unwrap();
            prop_assert_eq!(resources.available(), &pool);
        }
    }
}
