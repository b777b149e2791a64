//! # mdsync
//!
//! Keeps a search index in step with a directory of Markdown files.
//!
//! A bulk sync walks the documents root, hashes every matching file and
//! diffs the result against a JSON manifest of what was last indexed. Only
//! the difference becomes work: one upsert job per added or modified file
//! and one delete job per vanished file. Jobs go through a durable queue
//! with per-path exclusion and exponential backoff, and a pool of workers
//! feeds them to the indexing pipeline (chunking, optional embeddings,
//! SQLite FTS5 plus vectors). The manifest is updated per file as each job
//! succeeds, so an interrupted sync resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Scanner │──▶│   Diff   │──▶│  Queue   │──▶│ Workers  │──▶│ Pipeline │
//! │ walkdir  │   │ manifest │   │ SQLite / │   │ per-path │   │ chunk +  │
//! │ + sha256 │   │  vs scan │   │  memory  │   │  locks   │   │  embed   │
//! └──────────┘   └──────────┘   └──────────┘   └────┬─────┘   └──────────┘
//!      ▲                                            │
//! ┌────┴─────┐                                      ▼
//! │ Watcher  │                               ┌────────────┐
//! │ (notify) │                               │  Manifest  │
//! └──────────┘                               └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mdsync init                   # create database
//! mdsync sync --dry-run         # show what would change
//! mdsync sync                   # index the difference
//! mdsync watch                  # keep syncing on file changes
//! mdsync status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`error`] | Error classification for retries |
//! | [`scan`] | Walking the documents root |
//! | [`hasher`] | Content digests |
//! | [`manifest`] | Persistent record of indexed files |
//! | [`diff`] | Scan vs. manifest comparison |
//! | [`job`] | Sync jobs and their state machine |
//! | [`queue`] | Durable job queue with retries |
//! | [`worker`] | Worker pool |
//! | [`context`] | Collaborators shared by workers and orchestrator |
//! | [`orchestrator`] | Bulk sync runs and live events |
//! | [`progress`] | Progress reporting on stderr |
//! | [`watcher`] | Filesystem notifications |
//! | [`index`] | Indexing pipeline seam and SQLite index |
//! | [`chunk`] | Markdown chunking |
//! | [`embedding`] | Embedding providers |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod diff;
pub mod embedding;
pub mod error;
pub mod hasher;
pub mod index;
pub mod job;
pub mod logging;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod scan;
pub mod watcher;
pub mod worker;
