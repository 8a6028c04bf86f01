//! `dsm-node`: stands up one participant in a DSM cluster and idles,
//! printing stats on a timer, until interrupted. Intended for manual
//! testing and the integration test harness; real applications link
//! against the `dsm` library directly instead of shelling out to this.

use std::os::unix::io::RawFd;
use std::time::Duration;

use clap::Parser;
use dsm::Config;

/// Write end of the self-pipe, set once by `install_shutdown_signals`
/// and read by the signal handler below. Not the SIGSEGV handler in
/// `fault.rs` — this one only ever fires for SIGINT/SIGTERM.
static mut SHUTDOWN_WRITE_FD: RawFd = -1;

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    let fd = unsafe { SHUTDOWN_WRITE_FD };
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs SIGINT/SIGTERM handlers that each write one byte to a pipe,
/// and returns the pipe's read end. `main` blocks on that fd instead of
/// running arbitrary work inside the signal handler.
fn install_shutdown_signals() -> std::io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    unsafe {
        SHUTDOWN_WRITE_FD = write_fd;
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_shutdown_signal as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(read_fd)
}

/// Blocks until a byte arrives on `read_fd`, i.e. until SIGINT or
/// SIGTERM is delivered.
fn wait_for_shutdown(read_fd: RawFd) {
    let mut byte: u8 = 0;
    loop {
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n > 0 {
            return;
        }
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "dsm-node", about = "Run one node of a DSM cluster")]
struct Args {
    /// This node's id; node 0 is always the manager, node 1 the backup.
    #[arg(long, env = "DSM_NODE_ID", default_value_t = 0)]
    node_id: u32,

    /// Port this node listens on (manager only).
    #[arg(long, env = "DSM_PORT", default_value_t = 9600)]
    port: u16,

    /// Manager's host (workers only).
    #[arg(long, env = "DSM_MANAGER_HOST", default_value = "127.0.0.1")]
    manager_host: String,

    /// Manager's port (workers only).
    #[arg(long, env = "DSM_MANAGER_PORT", default_value_t = 9600)]
    manager_port: u16,

    /// Total number of nodes expected to join the cluster.
    #[arg(long, env = "DSM_NUM_NODES", default_value_t = 1)]
    num_nodes: usize,

    /// Optional path to a TOML config file; CLI flags and DSM_* env
    /// vars override whatever it sets.
    #[arg(long)]
    config: Option<String>,

    /// 0=error .. 4=trace.
    #[arg(long, env = "DSM_LOG_LEVEL", default_value_t = 2)]
    log_level: u8,

    /// Seconds between stats printouts; 0 disables periodic printing.
    #[arg(long, default_value_t = 30)]
    stats_interval_secs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    config.node_id = args.node_id;
    config.port = args.port;
    config.manager_host = args.manager_host.clone();
    config.manager_port = args.manager_port;
    config.num_nodes = args.num_nodes;
    config.is_manager = args.node_id == 0;
    config.log_level = args.log_level;
    let config = config.apply_env_overrides();
    config.validate()?;

    dsm::init(config)?;
    tracing::info!(node_id = args.node_id, "dsm-node up");

    let shutdown_fd = install_shutdown_signals()?;

    if args.stats_interval_secs > 0 {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(args.stats_interval_secs));
            let _ = dsm::print_stats();
        });
    }

    wait_for_shutdown(shutdown_fd);
    tracing::info!(node_id = args.node_id, "shutdown signal received, finalizing");
    dsm::finalize();
    Ok(())
}
