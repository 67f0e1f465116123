//! qconn CLI - talk to a qconn broker from the command line.
//!
//! This is the binary entry point. See the `qconn` library for the protocol
//! implementation; every subcommand here is a thin caller.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use qconn::{
    CntlService, Config, FileService, LauncherService, Permissions, SInfoService, Signal,
};

// CLI
#[derive(Parser)]
#[command(name = "qconn")]
#[command(version)]
#[command(about = "Client for the qconn remote debug broker")]
struct Cli {
    /// Broker host (overrides config and QCONN_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port (overrides config and QCONN_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Per-read deadline in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print structured results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe the broker (OS, host name, version)
    Info,
    #[command(flatten)]
    File(FileCommand),
    #[command(flatten)]
    SInfo(SInfoCommand),
    /// Send a signal to a process
    Kill {
        pid: i32,
        /// Signal name or number
        #[arg(short, long, default_value_t = Signal::Kill)]
        signal: Signal,
    },
    /// Run a program on the target and print its output
    Exec {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Subcommands served by the file service.
#[derive(Subcommand)]
enum FileCommand {
    /// List a remote directory
    Ls { path: String },
    /// Print a remote file to stdout
    Cat { path: String },
    /// Copy a remote file to a local path
    Get { remote: String, local: PathBuf },
    /// Copy a local file to a remote path
    Put {
        local: PathBuf,
        remote: String,
        /// Octal permission bits for the remote file
        #[arg(long, default_value = "644", value_parser = parse_mode)]
        mode: Permissions,
    },
    /// Delete a remote file or empty directory
    Rm { path: String },
    /// Rename a remote file
    Mv { source: String, dest: String },
    /// Create a remote directory
    Mkdir {
        path: String,
        /// Octal permission bits for the new directory
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: Permissions,
    },
    /// Show metadata of a remote path
    Stat { path: String },
}

/// Subcommands served by the sinfo service.
#[derive(Subcommand)]
enum SInfoCommand {
    /// List remote processes
    Ps,
    /// Show the memory maps of a process
    Mmaps { pid: i32 },
    /// Show host name and memory summary
    Sysinfo,
}

fn parse_mode(s: &str) -> Result<Permissions, String> {
    u32::from_str_radix(s, 8)
        .map(Permissions::from_mode)
        .map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = Config::load();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secs) = cli.timeout {
        config.read_timeout_secs = secs;
    }
    log::debug!("[CLI] Using broker {}", config.addr());

    let json = cli.json;
    match cli.command {
        Commands::Info => {
            let info = qconn::broker_info(&config)
                .await
                .with_context(|| format!("query broker at {}", config.addr()))?;
            if json {
                print_json(&info)?;
            } else {
                for (key, value) in info.iter() {
                    println!("{key}={value}");
                }
            }
        }
        Commands::SInfo(command) => {
            let mut sinfo = SInfoService::connect(&config)
                .await
                .context("connect to sinfo service")?;
            let result = run_sinfo_command(&mut sinfo, command, json).await;
            if let Err(e) = sinfo.disconnect().await {
                log::debug!("[CLI] SInfo disconnect failed: {e}");
            }
            result?;
        }
        Commands::Kill { pid, signal } => {
            let mut cntl = CntlService::connect(&config)
                .await
                .context("connect to cntl service")?;
            let result = cntl.signal_process(pid, signal).await;
            if let Err(e) = cntl.disconnect().await {
                log::debug!("[CLI] Cntl disconnect failed: {e}");
            }
            result.with_context(|| format!("send {signal} to {pid}"))?;
        }
        Commands::Exec { command, args } => {
            let mut launcher = LauncherService::connect(&config)
                .await
                .context("connect to launcher service")?;
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let result = launcher.execute(&command, &args).await;
            if let Err(e) = launcher.disconnect().await {
                log::debug!("[CLI] Launcher disconnect failed: {e}");
            }
            let output = result.with_context(|| format!("run {command}"))?;
            print!("{output}");
        }
        Commands::File(command) => {
            let mut files = FileService::connect(&config)
                .await
                .context("connect to file service")?;
            let result = run_file_command(&mut files, command, json).await;
            if let Err(e) = files.disconnect().await {
                log::debug!("[CLI] File disconnect failed: {e}");
            }
            result?;
        }
    }

    Ok(())
}

async fn run_file_command(files: &mut FileService, command: FileCommand, json: bool) -> Result<()> {
    match command {
        FileCommand::Ls { path } => {
            let entries = files.list(&path).await.with_context(|| format!("list {path}"))?;
            if json {
                print_json(&entries)?;
            } else {
                for entry in entries {
                    println!("{entry}");
                }
            }
        }
        FileCommand::Cat { path } => {
            let data = files.read_file(&path).await.with_context(|| format!("read {path}"))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        FileCommand::Get { remote, local } => {
            let data = files
                .read_file(&remote)
                .await
                .with_context(|| format!("read {remote}"))?;
            tokio::fs::write(&local, &data)
                .await
                .with_context(|| format!("write {}", local.display()))?;
            log::info!("[CLI] Copied {} bytes to {}", data.len(), local.display());
        }
        FileCommand::Put { local, remote, mode } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("read {}", local.display()))?;
            files
                .write_file(&remote, &data, mode)
                .await
                .with_context(|| format!("write {remote}"))?;
            log::info!("[CLI] Copied {} bytes to {remote}", data.len());
        }
        FileCommand::Rm { path } => {
            files.delete(&path).await.with_context(|| format!("delete {path}"))?;
        }
        FileCommand::Mv { source, dest } => {
            files
                .rename(&source, &dest)
                .await
                .with_context(|| format!("move {source} to {dest}"))?;
        }
        FileCommand::Mkdir { path, mode } => {
            files.mkdir(&path, mode).await.with_context(|| format!("mkdir {path}"))?;
        }
        FileCommand::Stat { path } => {
            let stat = files.stat_path(&path).await.with_context(|| format!("stat {path}"))?;
            if json {
                print_json(&stat)?;
            } else {
                let kind = if stat.is_dir() {
                    "directory"
                } else if stat.is_file() {
                    "file"
                } else {
                    "other"
                };
                println!("path:  {path}");
                println!("type:  {kind}");
                println!("size:  {}", stat.size);
                println!("mode:  {:o}", stat.mode);
                println!("uid:   {}", stat.uid);
                println!("gid:   {}", stat.gid);
                println!("mtime: {}", stat.mtime);
            }
        }
    }
    Ok(())
}

async fn run_sinfo_command(
    sinfo: &mut SInfoService,
    command: SInfoCommand,
    json: bool,
) -> Result<()> {
    match command {
        SInfoCommand::Ps => {
            let pids = sinfo.get_pids().await.context("get process table")?;
            if json {
                print_json(&pids)?;
            } else {
                println!("{:>8} {:>8} {:>7}  PATH", "PID", "PPID", "THREADS");
                for process in pids.values() {
                    println!(
                        "{:>8} {:>8} {:>7}  {}",
                        process.pid, process.parent, process.num_threads, process.path
                    );
                }
            }
        }
        SInfoCommand::Mmaps { pid } => {
            let maps = sinfo
                .get_mmaps(pid)
                .await
                .with_context(|| format!("get memory maps of {pid}"))?;
            if json {
                print_json(&maps)?;
            } else {
                for map in &maps {
                    println!(
                        "{:#012x} {:>10} {:>10}  {}",
                        map.vaddr, map.size, map.offset, map.path
                    );
                }
            }
        }
        SInfoCommand::Sysinfo => {
            let info = sinfo.get_sysinfo().await.context("get system info")?;
            if json {
                print_json(&info)?;
            } else {
                println!("hostname:  {}", info.hostname);
                println!("mem total: {}", info.mem_total);
                println!("mem free:  {}", info.mem_free);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
