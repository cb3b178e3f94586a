//! Purpose: Client-side data access over a partitioned wide-column table store.
//! Exports: `api` (connection, queries, CRUD, property source), `config`, `core`, and `emulator` behind the `emulator` feature.
//! Role: Library crate; callers normally import from `api`.
//! Invariants: All operations are blocking and run on the caller's thread.
//! Invariants: `core` holds pure data types and codecs; only `api` performs network I/O.
pub mod api;
pub mod config;
pub mod core;
#[cfg(feature = "emulator")]
pub mod emulator;
