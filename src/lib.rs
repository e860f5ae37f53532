pub mod about;
pub mod aligner;
pub mod amplicon;
pub mod blob_store;
pub mod chunk_store;
pub mod cluster_merge;
pub mod cluster_task;
pub mod config;
pub mod dataset;
pub mod detagger;
pub mod error;
pub mod iupac_code;
pub mod job;
pub mod job_sequences;
pub mod orchestrator;
pub mod pairing;
pub mod quality_filter;
pub mod read;
pub mod read_parser;
pub mod reads;
pub mod transport;
pub mod union_find;
