//! # Shelf
//!
//! Bibliographic search and chat service for a book store.
//!
//! Shelf has two halves. The reindex pipeline projects the canonical
//! catalog (SQLite) into a fresh OpenSearch index and swaps the serving
//! aliases once the new index verifies. The chat service answers customer
//! questions, grounded either in retrieved policy documents or in the
//! commerce backend through a small set of tools with a confirmation
//! workflow for anything that changes an order.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │ canonical  │──▶│   reindex   │──▶│ OpenSearch │
//! │  (SQLite)  │   │ state mach. │   │  aliases   │
//! └────────────┘   └─────────────┘   └─────┬──────┘
//!                                          │ RAG
//!   HTTP ──▶ chat ──▶ policy ──┬──▶ tools ─┼──▶ commerce
//!                              └──▶ LLM gateway (failover, streaming)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema |
//! | [`cache`] | Redis cache backend |
//! | [`session_store`] | SQLite session, event and audit store |
//! | [`opensearch`] | OpenSearch REST client |
//! | [`reindex`] | Reindex job runner and job repository |
//! | [`model_service`] | Embedding and rerank client |
//! | [`rag`] | Hybrid retrieval with RRF fusion |
//! | [`llm`] | Multi-provider LLM gateway |
//! | [`commerce`] | Commerce backend client |
//! | [`guardrails`] | Rate limits and LLM call budget |
//! | [`tools`] | Tool router and confirmation workflow |
//! | [`chat`] | Chat turn orchestration |
//! | [`server`] | HTTP surface |

pub mod cache;
pub mod chat;
pub mod commerce;
pub mod config;
pub mod db;
pub mod guardrails;
pub mod llm;
pub mod migrate;
pub mod model_service;
pub mod opensearch;
pub mod rag;
pub mod reindex;
pub mod server;
pub mod session_store;
pub mod tools;
