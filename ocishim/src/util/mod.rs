mod process;

pub use process::{
    ProcStat, Reap, is_process_alive, is_same_process, live_start_time, pidfd_open,
    pidfd_supported, probe, read_proc_stat, reap, send_signal, set_child_subreaper,
};
