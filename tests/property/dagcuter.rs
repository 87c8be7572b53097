// tests/property/dagcuter.rs

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use dagflow::dag::dagcuter::BoxFuture;
use dagflow::dag::{DagGraph, Dagcuter, Outputs, Unit};
use dagflow::errors::DagflowError;

struct Recording {
    deps: Vec<String>,
    name: String,
    fail: bool,
    order: Arc<Mutex<Vec<String>>>,
}

impl Unit for Recording {
    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn execute(
        &self,
        _cancel: CancellationToken,
        _inputs: Outputs,
    ) -> BoxFuture<'_, anyhow::Result<Outputs>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            self.order.lock().unwrap().push(self.name.clone());
            Ok(Outputs::new())
        })
    }
}

// Unit i may only depend on units 0..i, so every generated graph is acyclic.
fn dag_strategy(max_units: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_units).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let deps: BTreeSet<usize> = if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        };
                        deps.into_iter().collect()
                    })
                    .collect()
            },
        )
    })
}

fn name(i: usize) -> String {
    format!("u{i}")
}

fn build_units(
    deps: &[Vec<usize>],
    failing: Option<usize>,
    order: &Arc<Mutex<Vec<String>>>,
) -> HashMap<String, Arc<dyn Unit>> {
    deps.iter()
        .enumerate()
        .map(|(i, ds)| {
            let unit = Recording {
                deps: ds.iter().map(|d| name(*d)).collect(),
                name: name(i),
                fail: failing == Some(i),
                order: Arc::clone(order),
            };
            (name(i), Arc::new(unit) as Arc<dyn Unit>)
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn acyclic_graphs_complete_in_dependency_order(deps in dag_strategy(12), workers in 1i64..4) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let units = build_units(&deps, None, &order);

        let rt = runtime();
        let results = rt.block_on(async {
            let dag = Dagcuter::with_workers(units, workers).unwrap();
            let res = dag.execute(&CancellationToken::new()).await;
            dag.close().await;
            res
        });
        let results = results.unwrap();
        prop_assert_eq!(results.len(), deps.len());

        let order = order.lock().unwrap().clone();
        prop_assert_eq!(order.len(), deps.len());
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        for (i, ds) in deps.iter().enumerate() {
            for d in ds {
                prop_assert!(position[name(*d).as_str()] < position[name(i).as_str()]);
            }
        }
    }

    #[test]
    fn failed_unit_never_lets_dependents_run(deps in dag_strategy(10), pick in any::<usize>()) {
        let failing = pick % deps.len();
        let order = Arc::new(Mutex::new(Vec::new()));
        let units = build_units(&deps, Some(failing), &order);

        let rt = runtime();
        let res = rt.block_on(async {
            let dag = Dagcuter::with_workers(units, 2).unwrap();
            let res = dag.execute(&CancellationToken::new()).await;
            dag.close().await;
            res
        });
        prop_assert!(res.is_err());

        // Everything downstream of the failing unit, transitively.
        let mut downstream = BTreeSet::from([failing]);
        for (i, ds) in deps.iter().enumerate() {
            if ds.iter().any(|d| downstream.contains(d)) {
                downstream.insert(i);
            }
        }
        let order = order.lock().unwrap().clone();
        for i in downstream {
            prop_assert!(!order.contains(&name(i)));
        }
    }

    #[test]
    fn back_edge_is_reported_as_cycle(deps in dag_strategy(10), from in any::<usize>(), to in any::<usize>()) {
        prop_assume!(deps.len() >= 2);
        let n = deps.len();
        let a = from % n;
        let b = to % n;
        prop_assume!(a != b);
        let (lo, hi) = (a.min(b), a.max(b));

        // Force a path lo -> hi, then close it with hi <- lo reversed.
        let mut deps = deps;
        if !deps[hi].contains(&lo) {
            deps[hi].push(lo);
        }
        deps[lo].push(hi);

        let edges = deps
            .iter()
            .enumerate()
            .map(|(i, ds)| (name(i), ds.iter().map(|d| name(*d)).collect::<Vec<_>>()));
        let err = DagGraph::from_dependencies(edges).unwrap_err();
        prop_assert!(matches!(err, DagflowError::DagCycle(_)), "unexpected error: {}", err);
    }
}
