/// Non-negative monetary amounts.
pub mod money;

/// Account balances, mutated by applying events produced from credit and
/// debit requests.
pub mod account;

/// Validated balance-mutation requests and their queue wire format.
pub mod instruction;

/// Append-only audit records written alongside every balance change.
pub mod ledger;

/// Balance and ledger storage behind scoped, all-or-nothing transactions.
pub mod store;

/// At-least-once hand-off of instructions between submitters and processors.
pub mod queue;

/// Applies one instruction atomically: locks, checks, updates, records.
pub mod mutator;

/// Queue consumer deciding ack, requeue or dead-letter for each delivery.
pub mod processor;

/// Request validation in front of the queue, plus ledger history reads.
pub mod gateway;

/// Bootstraps the engine for the binary: configuration, logging, consumers.
pub mod bin_utils;
