pub mod gc_info;
pub mod trace_trait;
