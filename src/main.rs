mod app;
mod attrs;
mod config;
mod cryptor;
mod engine;
mod error;
mod filters;
mod list;
mod mangle;
mod rawlog;
mod repo;
mod setup;
mod transform;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use app::App;
use config::OptionFlags;
use error::Result;
use rawlog::SkipFilters;

const EXIT_GENERIC: i32 = 1;
const EXIT_NO_FILE: i32 = 100;

#[derive(Parser)]
#[command(name = "git-sops")]
#[command(version)]
#[command(about = "Transparent SOPS encryption of secret files in git", long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Enable verbose logging output
    #[arg(short, long, global = true, env = "SOPS_VERBOSE")]
    verbose: bool,

    /// Enable trace logging output
    #[arg(long, global = true, env = "SOPS_TRACE")]
    trace: bool,

    /// Run as if started in the given path
    #[arg(short = 'C', long = "change-dir", global = true, env = "SOPS_CHANGE_DIR")]
    change_dir: Option<std::path::PathBuf>,

    /// Age recipients
    #[arg(short, long, global = true, env = "SOPS_AGE")]
    age: Option<String>,

    /// Default YAML indent
    #[arg(long, global = true, env = "SOPS_INDENT")]
    indent: Option<usize>,

    /// Rename YAML keys: from1:to1,from2:to2,...
    #[arg(long = "rename-keys", global = true, env = "SOPS_RENAME_KEYS")]
    rename_keys: Option<String>,

    /// Also encrypt comments with the given suffix ("all" or unset: every
    /// comment, "none": no comments)
    #[arg(
        long = "encrypted-comment-suffix",
        global = true,
        env = "SOPS_ENCRYPTED_COMMENT_SUFFIX"
    )]
    encrypted_comment_suffix: Option<String>,

    /// Also encrypt comments with the given prefix
    #[arg(
        long = "encrypted-comment-prefix",
        global = true,
        env = "SOPS_ENCRYPTED_COMMENT_PREFIX"
    )]
    encrypted_comment_prefix: Option<String>,

    /// Keep YAML formatting: comma-separated mark classes or true/false
    #[arg(long = "keep-formatting", global = true, env = "SOPS_KEEP_FORMATTING")]
    keep_formatting: Option<String>,

    /// Ignore MAC mismatch
    #[arg(long = "ignore-mac", global = true, env = "SOPS_IGNORE_MAC")]
    ignore_mac: bool,

    /// Use the file modtime as metadata lastmodified
    #[arg(long = "file-modtime", global = true, env = "SOPS_FILE_MODTIME")]
    file_modtime: bool,

    /// Number of master keys required to retrieve the data key with shamir
    #[arg(
        long = "shamir-secret-sharing-threshold",
        global = true,
        env = "SOPS_SHAMIR_THRESHOLD"
    )]
    shamir_secret_sharing_threshold: Option<u32>,
}

impl GlobalArgs {
    fn option_flags(&self) -> OptionFlags {
        OptionFlags {
            age: self.age.clone(),
            indent: self.indent,
            rename_keys: self.rename_keys.clone(),
            encrypted_comment_suffix: self.encrypted_comment_suffix.clone(),
            encrypted_comment_prefix: self.encrypted_comment_prefix.clone(),
            keep_formatting: self.keep_formatting.clone(),
            ignore_mac: self.ignore_mac,
            file_modtime: self.file_modtime,
            shamir_threshold: self.shamir_secret_sharing_threshold,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt file data from stdin to stdout for the given path
    Clean {
        path: Option<String>,
        /// Read data directly from the file instead of stdin
        #[arg(long = "read-file")]
        read_file: bool,
        /// Parent file location: commit hash, "none", "worktree" or "index"
        #[arg(long)]
        parent: Option<String>,
        /// Fixed modtime formatted as YYYY-MM-DDThh:mm:ss UTC
        #[arg(long = "last-modified")]
        last_modified: Option<String>,
    },

    /// Decrypt file data from stdin to stdout for the given path
    Smudge {
        path: Option<String>,
        /// Read data directly from the file instead of stdin
        #[arg(long = "read-file")]
        read_file: bool,
    },

    /// Decrypt data from the given file to stdout
    Textconv { file: Option<String> },

    /// Merge encrypted branches
    Merge {
        path: String,
        ancestor: String,
        current: String,
        other: String,
    },

    /// Encrypt current branch history
    Encrypt {
        branch: Option<String>,
        /// Delete the target branch if it exists
        #[arg(short, long)]
        force: bool,
        /// Print progress
        #[arg(short = 'P', long)]
        progress: bool,
    },

    /// Decrypt current branch history
    Decrypt {
        branch: Option<String>,
        /// Delete the target branch if it exists
        #[arg(short, long)]
        force: bool,
        /// Print progress
        #[arg(short = 'P', long)]
        progress: bool,
    },

    /// Mark current branch as encrypted, re-enable push
    SetEncrypted { branch: Option<String> },

    /// Mark current branch as decrypted, disable push
    SetDecrypted { branch: Option<String> },

    /// Set up the git repository for SOPS encryption
    Setup {
        /// Force action if the repository is already set up
        #[arg(short, long, env = "SOPS_FORCE")]
        force: bool,
        /// Set up a bare repository by probing a file
        #[arg(long = "probe-file", env = "SOPS_PROBE_FILE")]
        probe_file: Option<String>,
        /// Expected contents of the probed file
        #[arg(long = "probe-text", env = "SOPS_PROBE_TEXT")]
        probe_text: Option<String>,
    },

    /// Remove SOPS settings from the git repository
    Teardown,

    /// Show SOPS encryption status for the current branch
    Status,

    /// List secret files eligible for encryption
    Ls {
        /// Walk the index instead of the worktree
        #[arg(long)]
        staged: bool,
    },

    /// Change permissions on secret files to prevent others' access
    Chmod,

    /// Perform git checkout and settle the index
    Checkout {
        branch: Option<String>,
        /// Be quiet
        #[arg(short, long)]
        quiet: bool,
        /// Force checkout if the worktree is dirty
        #[arg(short, long)]
        force: bool,
        /// Create a new branch
        #[arg(short = 'b', long = "branch")]
        create: bool,
    },

    /// Show git log with raw encrypted blobs
    Rawlog {
        /// Show colored diff
        #[arg(short, long, env = "SOPS_COLORIZE")]
        colorize: bool,
        /// Skip all supported patterns, same as -H -M -E -B -S -R together
        #[arg(short = 'A', long = "skip-all", env = "SOPS_SKIP_ALL")]
        skip_all: bool,
        /// Skip hunk marks e.g. "@@ -9,4 +15,4"
        #[arg(short = 'H', long = "skip-hunk-marks", env = "SOPS_SKIP_HUNK_MARKS")]
        skip_hunk_marks: bool,
        /// Skip the metadata section
        #[arg(short = 'M', long = "skip-metadata", env = "SOPS_SKIP_METADATA")]
        skip_metadata: bool,
        /// Skip encrypted keys
        #[arg(short = 'E', long = "skip-encrypted", env = "SOPS_SKIP_ENCRYPTED")]
        skip_encrypted: bool,
        /// Skip blank lines
        #[arg(short = 'B', long = "skip-blank-lines", env = "SOPS_SKIP_BLANK_LINES")]
        skip_blank_lines: bool,
        /// Skip same lines
        #[arg(short = 'S', long = "skip-same-lines", env = "SOPS_SKIP_SAME_LINES")]
        skip_same_lines: bool,
        /// Skip removed lines
        #[arg(short = 'R', long = "skip-removals", env = "SOPS_SKIP_REMOVALS")]
        skip_removals: bool,
        /// Extra arguments passed to git log
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        ext: Vec<String>,
    },

    /// Mangle/demangle a YAML file through the store round trip
    TestMangle {
        path: Option<String>,
        /// Mangle/demangle the input yaml
        #[arg(long)]
        mangle: bool,
    },

    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.globals);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(EXIT_GENERIC);
    }
}

fn init_logging(globals: &GlobalArgs) {
    let level = if globals.trace {
        "trace"
    } else if globals.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn require_file(path: Option<String>) -> String {
    match path {
        Some(path) if !path.is_empty() => path,
        _ => {
            eprintln!("Error: no file specified");
            std::process::exit(EXIT_NO_FILE);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(dir) = &cli.globals.change_dir {
        std::env::set_current_dir(dir)?;
    }
    if let Commands::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let flags = cli.globals.option_flags();
    let app = App::new(&flags)?;

    match cli.command {
        Commands::Clean {
            path,
            read_file,
            parent,
            last_modified,
        } => {
            let path = require_file(path);
            let parent = parent.unwrap_or_else(|| "index".to_string());
            app.clean(
                &path,
                !read_file,
                &parent,
                last_modified.as_deref().unwrap_or(""),
            )
        }
        Commands::Smudge { path, read_file } => {
            let path = require_file(path);
            app.smudge(&path, !read_file, false)
        }
        Commands::Textconv { file } => {
            let file = require_file(file);
            app.textconv(&file)
        }
        Commands::Merge {
            path,
            ancestor,
            current,
            other,
        } => app.merge_driver(&path, &ancestor, &current, &other),
        Commands::Encrypt {
            branch,
            force,
            progress,
        } => app.transform_branch(branch.as_deref().unwrap_or(""), true, force, progress),
        Commands::Decrypt {
            branch,
            force,
            progress,
        } => app.transform_branch(branch.as_deref().unwrap_or(""), false, force, progress),
        Commands::SetEncrypted { branch } => {
            app.repo
                .mark_branch(branch.as_deref().unwrap_or(""), true, true)
        }
        Commands::SetDecrypted { branch } => {
            app.repo
                .mark_branch(branch.as_deref().unwrap_or(""), false, true)
        }
        Commands::Setup {
            force,
            probe_file,
            probe_text,
        } => app.setup_repo(
            force,
            probe_file.as_deref().unwrap_or(""),
            probe_text.as_deref().unwrap_or(""),
        ),
        Commands::Teardown => app.teardown_repo(false),
        Commands::Status => app.show_status(),
        Commands::Ls { staged } => app.list_files(staged),
        Commands::Chmod => app.chmod_files(None),
        Commands::Checkout {
            branch,
            quiet,
            force,
            create,
        } => app.checkout_wrapper(branch.as_deref().unwrap_or(""), quiet, force, create),
        Commands::Rawlog {
            colorize,
            skip_all,
            skip_hunk_marks,
            skip_metadata,
            skip_encrypted,
            skip_blank_lines,
            skip_same_lines,
            skip_removals,
            ext,
        } => {
            let filters = if skip_all {
                SkipFilters::all()
            } else {
                SkipFilters {
                    hunk_marks: skip_hunk_marks,
                    metadata: skip_metadata,
                    encrypted: skip_encrypted,
                    blank_lines: skip_blank_lines,
                    same_lines: skip_same_lines,
                    removals: skip_removals,
                    ..Default::default()
                }
            };
            app.raw_log(colorize, filters, &ext)
        }
        Commands::TestMangle { path, mangle } => {
            let path = require_file(path);
            app.test_mangle(&path, mangle)
        }
        Commands::Version => unreachable!(),
    }
}
