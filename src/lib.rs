//! # askdoc
//!
//! A retrieval-augmented answer engine for uploaded documents.
//!
//! askdoc answers natural-language questions about a document by retrieving
//! semantically relevant passages from a vector index and synthesizing a
//! cited answer through an external generation service. Compute instances
//! are stateless: every collection's index is mirrored to durable blob
//! storage with versioned optimistic writes, and chat history lives in
//! SQLite.
//!
//! ## Architecture
//!
//! ```text
//! upload ──▶ Chunker ──▶ Embedding ──▶ VectorIndex ──▶ SyncManager ──▶ Blob
//!                        Client                            ▲          Storage
//!                                                          │ restore
//! question ──▶ Retriever ──▶ Synthesizer ──▶ SessionStore ─┴─▶ Turn
//!              (reads index)  (generation      (SQLite)
//!                              service)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askdoc init                                  # create session database
//! askdoc ingest report.txt                     # chunk + embed + persist
//! askdoc ask report.txt "What is the deadline?" --user u1
//! askdoc serve                                 # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed error taxonomy |
//! | [`chunker`] | Deterministic overlapping chunking |
//! | [`embedding`] | Embedding service contract + HTTP client |
//! | [`index`] | In-process nearest-neighbor index |
//! | [`blob`] | Durable blob storage (memory, fs, s3) |
//! | [`sync`] | Snapshot restore/persist with version checks |
//! | [`retriever`] | Top-k retrieval with lazy restore |
//! | [`synthesizer`] | Citation-aware answer synthesis |
//! | [`session`] | Per-user chat-session persistence |
//! | [`engine`] | Orchestration of ingest and ask |
//! | [`server`] | HTTP adapter |
//! | [`db`], [`migrate`] | SQLite connection and schema |

pub mod blob;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod migrate;
pub mod models;
pub mod retriever;
pub mod server;
pub mod session;
pub mod sync;
pub mod synthesizer;
