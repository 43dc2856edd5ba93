//! Storages are external collaborators behind a thin capability set (§4.6,
//! §9): `begin_read(record) -> observed_owner_id` and
//! `append_write(record, log_entry)`. The transactional core never depends on
//! a concrete storage type, only on that capability, so masstree/hash-style
//! index implementations can be added later without touching `xct::manager`.

pub mod array;

pub use array::ArrayStorage;
