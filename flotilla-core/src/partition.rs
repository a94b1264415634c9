//! Resource partitioner: splits idle capacity across tenants.
//!
//! Phase 1 satisfies guarantees, phase 2 hands still-idle nodes to tenants
//! with headroom in proportion to their elastic range, phase 3 writes the
//! borrow/lend ledger. Everything is recomputed from scratch each cycle, so
//! a lender with fresh demand reclaims its guarantee on the next cycle
//! without an explicit revocation step.
//!
//! Guarantees are fractions of online capacity (busy nodes included); only
//! idle nodes are handed out, so running jobs are never preempted by a
//! reallocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::Requirements;
use crate::matcher::SpecializationMatcher;
use crate::node::Node;
use crate::tenant::Tenant;

/// Per-tenant result of one partitioning pass. The borrow/lend ledgers are
/// expressed in node units; fractional values appear when several lenders
/// split one borrowed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub tenant_id: String,
    pub nodes: Vec<String>,
    /// Percentage of online capacity allocated this cycle.
    pub allocated_share: f64,
    pub borrowed_from: BTreeMap<String, f64>,
    pub lent_to: BTreeMap<String, f64>,
}

impl Allocation {
    fn empty(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            nodes: Vec::new(),
            allocated_share: 0.0,
            borrowed_from: BTreeMap::new(),
            lent_to: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutcome {
    pub allocations: BTreeMap<String, Allocation>,
    /// True when idle capacity could not cover the guarantees in demand.
    pub under_capacity: bool,
}

/// Split `idle_nodes` across tenants.
///
/// `online_count` is the full online fleet (busy included): guarantees are
/// promised against it. `demand` is the per-tenant count of runnable jobs.
/// `profiles` carries each tenant's aggregate requirement profile so the
/// best-fitting nodes go where they matter.
pub fn allocate(
    tenants: &[&Tenant],
    online_count: usize,
    idle_nodes: &[&Node],
    demand: &BTreeMap<String, usize>,
    profiles: &BTreeMap<String, Requirements>,
    matcher: &SpecializationMatcher,
) -> PartitionOutcome {
    let mut allocations: BTreeMap<String, Allocation> =
        tenants.iter().map(|t| (t.id.clone(), Allocation::empty(&t.id))).collect();

    // Deterministic pool ordering by node id.
    let mut pool: Vec<&Node> = idle_nodes.to_vec();
    pool.sort_by(|a, b| a.id.cmp(&b.id));

    let guaranteed_nodes: BTreeMap<&str, usize> = tenants
        .iter()
        .map(|t| (t.id.as_str(), share_of(t.guaranteed_share, online_count)))
        .collect();
    let max_nodes: BTreeMap<&str, usize> = tenants
        .iter()
        .map(|t| (t.id.as_str(), share_of(t.max_share, online_count)))
        .collect();

    let wanted: BTreeMap<&str, usize> = tenants
        .iter()
        .map(|t| {
            let d = demand.get(t.id.as_str()).copied().unwrap_or(0);
            (t.id.as_str(), d.min(guaranteed_nodes[t.id.as_str()]))
        })
        .collect();
    let wanted_total: usize = wanted.values().sum();
    let under_capacity = wanted_total > pool.len();

    // Phase 1: guarantees. Under capacity, scale each tenant's grant
    // proportionally (largest-remainder rounding, ties by tenant id).
    let grants: BTreeMap<&str, usize> = if under_capacity {
        proportional_grants(&wanted, pool.len())
    } else {
        wanted.clone()
    };

    let mut from_guarantee: BTreeMap<&str, usize> = BTreeMap::new();
    for tenant in tenants {
        let grant = grants.get(tenant.id.as_str()).copied().unwrap_or(0);
        let profile = profiles.get(tenant.id.as_str());
        for _ in 0..grant {
            let Some(node_id) = take_best(&mut pool, profile, matcher) else { break };
            allocations.get_mut(&tenant.id).expect("allocation seeded").nodes.push(node_id);
            *from_guarantee.entry(tenant.id.as_str()).or_insert(0) += 1;
        }
    }

    // Phase 2: elastic distribution, proportional-fair over the elastic range
    // (max - guaranteed), capped by headroom and remaining demand.
    let mut elastic: BTreeMap<&str, usize> = BTreeMap::new();
    if !under_capacity {
        loop {
            if pool.is_empty() {
                break;
            }
            let mut pick: Option<(f64, &Tenant)> = None;
            for tenant in tenants {
                let id = tenant.id.as_str();
                let have = allocations[id].nodes.len();
                let d = demand.get(id).copied().unwrap_or(0);
                let weight = tenant.max_share - tenant.guaranteed_share;
                if weight <= 0.0 || have >= d || have >= max_nodes[id] {
                    continue;
                }
                let taken = elastic.get(id).copied().unwrap_or(0);
                let ratio = (taken as f64 + 1.0) / weight;
                let better = match pick {
                    None => true,
                    Some((best_ratio, best)) => {
                        ratio < best_ratio || (ratio == best_ratio && tenant.id < best.id)
                    }
                };
                if better {
                    pick = Some((ratio, tenant));
                }
            }
            let Some((_, tenant)) = pick else { break };
            let profile = profiles.get(tenant.id.as_str());
            let Some(node_id) = take_best(&mut pool, profile, matcher) else { break };
            allocations.get_mut(&tenant.id).expect("allocation seeded").nodes.push(node_id);
            *elastic.entry(tenant.id.as_str()).or_insert(0) += 1;
        }
    }

    // Phase 3: attribute borrowed nodes to the tenants whose guarantees went
    // unused, splitting proportionally when there are several lenders.
    let unused: BTreeMap<&str, f64> = tenants
        .iter()
        .map(|t| {
            let id = t.id.as_str();
            let used = from_guarantee.get(id).copied().unwrap_or(0);
            (id, (guaranteed_nodes[id].saturating_sub(used)) as f64)
        })
        .collect();
    let unused_total: f64 = unused.values().sum();
    let elastic_total: f64 = elastic.values().map(|&n| n as f64).sum();

    if unused_total > 0.0 && elastic_total > 0.0 {
        // Capacity beyond everyone's guarantee has no lender; only the part
        // covered by idle guarantees is attributed.
        let attributable = elastic_total.min(unused_total);
        for tenant in tenants {
            let borrower = tenant.id.as_str();
            let e = elastic.get(borrower).copied().unwrap_or(0) as f64;
            if e == 0.0 {
                continue;
            }
            let borrowed = e / elastic_total * attributable;
            for lender in tenants {
                let lender_id = lender.id.as_str();
                let u = unused[lender_id];
                if u == 0.0 || lender_id == borrower {
                    continue;
                }
                let share = borrowed * u / unused_total;
                if share > 0.0 {
                    allocations
                        .get_mut(borrower)
                        .expect("allocation seeded")
                        .borrowed_from
                        .insert(lender_id.to_string(), share);
                    allocations
                        .get_mut(lender_id)
                        .expect("allocation seeded")
                        .lent_to
                        .insert(borrower.to_string(), share);
                }
            }
        }
    }

    if online_count > 0 {
        for alloc in allocations.values_mut() {
            alloc.allocated_share = alloc.nodes.len() as f64 / online_count as f64 * 100.0;
        }
    }

    PartitionOutcome { allocations, under_capacity }
}

fn share_of(percent: f64, capacity: usize) -> usize {
    ((percent / 100.0) * capacity as f64).floor() as usize
}

/// Largest-remainder proportional rounding of `wanted` down to `available`.
fn proportional_grants<'a>(
    wanted: &BTreeMap<&'a str, usize>,
    available: usize,
) -> BTreeMap<&'a str, usize> {
    let total: usize = wanted.values().sum();
    if total == 0 {
        return wanted.keys().map(|k| (*k, 0)).collect();
    }
    let mut grants: BTreeMap<&str, usize> = BTreeMap::new();
    let mut remainders: Vec<(f64, &str)> = Vec::new();
    let mut granted = 0usize;
    for (id, &w) in wanted {
        let exact = w as f64 * available as f64 / total as f64;
        let floor = exact.floor() as usize;
        grants.insert(id, floor);
        granted += floor;
        remainders.push((exact - floor as f64, id));
    }
    // Hand out the remainder to the largest fractional parts, tenant id as
    // the final tie-break.
    remainders.sort_by(|(fa, ida), (fb, idb)| {
        fb.partial_cmp(fa).unwrap_or(std::cmp::Ordering::Equal).then_with(|| ida.cmp(idb))
    });
    for (_, id) in remainders {
        if granted >= available {
            break;
        }
        *grants.get_mut(id).expect("seeded above") += 1;
        granted += 1;
    }
    grants
}

/// Remove and return the pool node that best fits the profile. Nodes that
/// fail the profile's hard requirements are skipped; with no profile the
/// lowest node id wins.
fn take_best(
    pool: &mut Vec<&Node>,
    profile: Option<&Requirements>,
    matcher: &SpecializationMatcher,
) -> Option<String> {
    if pool.is_empty() {
        return None;
    }
    let idx = match profile {
        None => 0,
        Some(req) => {
            let mut best: Option<(f64, usize)> = None;
            for (i, node) in pool.iter().enumerate() {
                let Some(score) = matcher.score_requirements(req, None, node) else { continue };
                let better = match best {
                    None => true,
                    // Strict > keeps the earliest (lowest id) on ties.
                    Some((bs, _)) => score > bs,
                };
                if better {
                    best = Some((score, i));
                }
            }
            match best {
                Some((_, i)) => i,
                // No node clears the hard gate; fall back to id order so the
                // guarantee is still honored in node count.
                None => 0,
            }
        }
    };
    Some(pool.remove(idx).id.clone())
}
