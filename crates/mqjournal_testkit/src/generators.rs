//! Property-based test generators using proptest.
//!
//! Operation sequences are generated as abstract seeds and then resolved
//! against a [`Model`], so every generated sequence is valid: updates and
//! deletes only target live ids and adds never reuse one.

use mqjournal_core::{CoreResult, Journal, Record, TransactionPhase, TransactionState};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Strategy for record payloads.
pub fn payload_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Strategy for user type tags.
pub fn user_type_strategy() -> impl Strategy<Value = u8> {
    1u8..=16
}

/// A non-transactional journal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Add a new record.
    Add {
        /// Record id.
        id: u64,
        /// User type tag.
        user_type: u8,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Replace a live record.
    Update {
        /// Record id.
        id: u64,
        /// User type tag.
        user_type: u8,
        /// Payload.
        payload: Vec<u8>,
    },
    /// Delete a live record.
    Delete {
        /// Record id.
        id: u64,
    },
}

impl Op {
    /// Appends the operation to `journal`.
    ///
    /// # Errors
    ///
    /// Returns the journal's error for the append.
    pub fn apply(&self, journal: &Journal, sync: bool) -> CoreResult<()> {
        match self {
            Self::Add {
                id,
                user_type,
                payload,
            } => journal.append_add(*id, *user_type, payload, sync),
            Self::Update {
                id,
                user_type,
                payload,
            } => journal.append_update(*id, *user_type, payload, sync),
            Self::Delete { id } => journal.append_delete(*id, sync),
        }
    }
}

#[derive(Debug, Clone)]
struct OpSeed {
    kind: u8,
    pick: usize,
    user_type: u8,
    payload: Vec<u8>,
}

fn op_seed_strategy(max_payload: usize) -> impl Strategy<Value = OpSeed> {
    (
        0u8..10,
        any::<usize>(),
        user_type_strategy(),
        payload_strategy(max_payload),
    )
        .prop_map(|(kind, pick, user_type, payload)| OpSeed {
            kind,
            pick,
            user_type,
            payload,
        })
}

fn resolve(seeds: Vec<OpSeed>) -> Vec<Op> {
    let mut live: Vec<u64> = Vec::new();
    let mut next_id = 1u64;
    let mut ops = Vec::with_capacity(seeds.len());
    for seed in seeds {
        // Half adds, the rest split between updates and deletes
        let op = match (seed.kind, live.is_empty()) {
            (0..=4, _) | (_, true) => {
                let id = next_id;
                next_id += 1;
                live.push(id);
                Op::Add {
                    id,
                    user_type: seed.user_type,
                    payload: seed.payload,
                }
            }
            (5..=7, false) => Op::Update {
                id: live[seed.pick % live.len()],
                user_type: seed.user_type,
                payload: seed.payload,
            },
            (_, false) => Op::Delete {
                id: live.swap_remove(seed.pick % live.len()),
            },
        };
        ops.push(op);
    }
    ops
}

/// Strategy for valid sequences of up to `max_ops` operations.
pub fn op_sequence_strategy(max_ops: usize, max_payload: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_seed_strategy(max_payload), 0..=max_ops).prop_map(resolve)
}

/// How a generated transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Committed.
    Commit,
    /// Rolled back.
    Rollback,
    /// Prepared and left open.
    Prepare,
    /// Prepared, then committed.
    PrepareCommit,
    /// Never finished.
    Abandon,
}

fn outcome_strategy() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => Just(Outcome::Commit),
        1 => Just(Outcome::Rollback),
        1 => Just(Outcome::Prepare),
        1 => Just(Outcome::PrepareCommit),
        1 => Just(Outcome::Abandon),
    ]
}

/// A transaction adding fresh records.
#[derive(Debug, Clone)]
pub struct TxPlan {
    /// Transaction id.
    pub tx_id: u64,
    /// Records added, as (id, user type, payload).
    pub adds: Vec<(u64, u8, Vec<u8>)>,
    /// How the transaction ends.
    pub outcome: Outcome,
}

/// Strategy for up to `max_txs` transactions with disjoint record ids.
pub fn tx_plans_strategy(max_txs: usize, max_records: usize) -> impl Strategy<Value = Vec<TxPlan>> {
    let plan = (
        prop::collection::vec((user_type_strategy(), payload_strategy(64)), 1..=max_records),
        outcome_strategy(),
    );
    prop::collection::vec(plan, 1..=max_txs).prop_map(|plans| {
        plans
            .into_iter()
            .enumerate()
            .map(|(i, (records, outcome))| {
                let tx_id = i as u64 + 1;
                let adds = records
                    .into_iter()
                    .enumerate()
                    .map(|(j, (user_type, payload))| (tx_id * 1_000 + j as u64, user_type, payload))
                    .collect();
                TxPlan {
                    tx_id,
                    adds,
                    outcome,
                }
            })
            .collect()
    })
}

/// Writes `plans` with their records interleaved, then ends each one.
///
/// # Errors
///
/// Returns the first append error.
pub fn write_tx_plans(journal: &Journal, plans: &[TxPlan]) -> CoreResult<()> {
    let longest = plans.iter().map(|p| p.adds.len()).max().unwrap_or(0);
    for step in 0..longest {
        for plan in plans {
            if let Some((id, user_type, payload)) = plan.adds.get(step) {
                journal.append_add_tx(plan.tx_id, *id, *user_type, payload)?;
            }
        }
    }
    for plan in plans {
        match plan.outcome {
            Outcome::Commit => journal.append_commit(plan.tx_id, false)?,
            Outcome::Rollback => journal.append_rollback(plan.tx_id, false)?,
            Outcome::Prepare => journal.append_prepare(plan.tx_id, &plan.tx_id.to_le_bytes(), false)?,
            Outcome::PrepareCommit => {
                journal.append_prepare(plan.tx_id, b"xid", false)?;
                journal.append_commit(plan.tx_id, false)?;
            }
            Outcome::Abandon => {}
        }
    }
    journal.flush()
}

/// Reference model of the committed record set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    records: BTreeMap<u64, (u8, Vec<u8>)>,
}

impl Model {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a non-transactional operation.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::Add {
                id,
                user_type,
                payload,
            }
            | Op::Update {
                id,
                user_type,
                payload,
            } => {
                self.records.insert(*id, (*user_type, payload.clone()));
            }
            Op::Delete { id } => {
                self.records.remove(id);
            }
        }
    }

    /// Applies the committed part of `plans`.
    pub fn apply_plans(&mut self, plans: &[TxPlan]) {
        for plan in plans {
            if matches!(plan.outcome, Outcome::Commit | Outcome::PrepareCommit) {
                for (id, user_type, payload) in &plan.adds {
                    self.records.insert(*id, (*user_type, payload.clone()));
                }
            }
        }
    }

    /// Returns the number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no record is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks that `loaded` holds exactly the model's records.
    ///
    /// # Panics
    ///
    /// Panics describing the first difference.
    pub fn assert_matches(&self, loaded: &[Record]) {
        let mut seen = BTreeSet::new();
        for record in loaded {
            let id = record.id.0;
            assert!(seen.insert(id), "record {id} loaded twice");
            let Some((user_type, payload)) = self.records.get(&id) else {
                panic!("record {id} loaded but not live");
            };
            assert_eq!(record.user_type, *user_type, "user type of {id}");
            assert_eq!(&record.payload, payload, "payload of {id}");
        }
        assert_eq!(
            seen.len(),
            self.records.len(),
            "missing records: {:?}",
            self.records
                .keys()
                .filter(|id| !seen.contains(id))
                .collect::<Vec<_>>()
        );
    }
}

/// Checks that `prepared` holds exactly the transactions of `plans` left
/// prepared, with all of their records.
///
/// # Panics
///
/// Panics describing the first difference.
pub fn assert_prepared(plans: &[TxPlan], prepared: &[TransactionState]) {
    let expected: Vec<&TxPlan> = plans
        .iter()
        .filter(|p| p.outcome == Outcome::Prepare)
        .collect();
    assert_eq!(prepared.len(), expected.len(), "prepared transactions");
    for plan in expected {
        let state = prepared
            .iter()
            .find(|s| s.id.0 == plan.tx_id)
            .unwrap_or_else(|| panic!("transaction {} not reported", plan.tx_id));
        assert_eq!(state.phase, TransactionPhase::Prepared);
        assert_eq!(state.extra_data, plan.tx_id.to_le_bytes());
        assert_eq!(state.records.len(), plan.adds.len());
        for (record, (id, _, payload)) in state.records.iter().zip(&plan.adds) {
            assert_eq!(record.id.0, *id);
            assert_eq!(&record.payload, payload);
        }
    }
}

/// Proptest configuration presets.
#[derive(Debug, Clone, Copy)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Few cases, for tests that restart journals on disk.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 12,
            max_shrink_iters: 100,
        }
    }

    /// Many cases, for in-memory runs.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1_000,
        }
    }

    /// Converts to a proptest configuration.
    #[must_use]
    pub fn to_config(self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
