use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;

use memtesterd::config::Environment;
use memtesterd::logger;
use memtesterd::patterns::test_mask_help;
use memtesterd::server::{ControlServer, DEFAULT_SOCKET_PATH, SOCKET_NAME};
use memtesterd::{log_info_fmt, AbortMonitor, HangupPolicy, HostMemory, ProcessExit, Session};

static PROCESS_EXIT: ProcessExit = ProcessExit;

#[derive(Parser, Debug)]
#[command(version, about = "Memory tester daemon driven over a local control socket", long_about = None)]
struct Cli {
    #[arg(short = 's', long = "socket", default_value = DEFAULT_SOCKET_PATH,
          help = "Control socket to listen on when none is inherited from init")]
    socket: PathBuf,

    #[arg(short = 'L', long = "log-path", default_value = "/var/log/memtesterd/",
          help = "Directory for memtesterd.log")]
    log_path: PathBuf,

    #[arg(long = "keep-serving",
          help = "Serve further clients instead of exiting with the first session's status")]
    keep_serving: bool,

    #[arg(long = "list-tests", help = "Print the test registry and mask bits")]
    list_tests: bool,

    /// Run one session on this terminal instead of serving, e.g. `-- 64M 1`
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn run(cli: Cli) -> Result<i32, Box<dyn Error>> {
    if cli.list_tests {
        for line in test_mask_help() {
            println!("{line}");
        }
        return Ok(0);
    }

    let local = !cli.command.is_empty();
    let log_file_path = cli.log_path.join("memtesterd.log");
    // Locally the session output already goes to the terminal.
    if let Err(e) = logger::init_logger(Some(log_file_path.as_path()), !local) {
        eprintln!("Failed to open log file {}: {}", log_file_path.display(), e);
    }
    log_info_fmt!("Log path: {}", log_file_path.display());

    if local {
        return Ok(run_local(&cli.command.join(" ")));
    }

    let server = match ControlServer::inherited(SOCKET_NAME)? {
        Some(server) => server,
        None => ControlServer::bind(&cli.socket)?,
    };
    let end = server.serve(&mut HostMemory, &PROCESS_EXIT, cli.keep_serving)?;
    log_info_fmt!("session ended: {:?}", end);
    Ok(end.exit_code())
}

/// Runs one session on stdout; a `stop` line on stdin aborts it.
fn run_local(command: &str) -> i32 {
    let abort = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let monitor_abort = Arc::clone(&abort);
    let monitor_finished = Arc::clone(&finished);
    thread::spawn(move || {
        AbortMonitor::new(io::stdin().lock(), monitor_abort, monitor_finished, &PROCESS_EXIT)
            .with_hangup_policy(HangupPolicy::Ignore)
            .run()
    });

    let end = Session::new(io::stdout(), abort).run(command, &Environment::capture(), &mut HostMemory);
    finished.store(true, Ordering::SeqCst);
    end.exit_code()
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            logger::log_error(&format!("memtesterd failed: {e}"));
            1
        }
    };
    process::exit(code);
}
