// src/constants.rs

/// Candidate fabfile names, probed in order inside the working directory.
pub const FABFILE_CANDIDATES: &[&str] = &["fabfile.toml", "Fabfile.toml"];

/// Name of the optional user settings file in the home directory.
pub const USER_SETTINGS_FILENAME: &str = ".fabric";

/// Environment variable that overrides the location of the user settings file.
pub const USER_SETTINGS_ENV: &str = "FAB_SETTINGS";

/// Maximum nesting of `$(name)` references followed during lazy substitution.
pub const MAX_LAZY_DEPTH: u32 = 32;

/// How often blocked waiters check the cancellation flag.
pub const CANCELLATION_POLL_MS: u64 = 50;

/// Shell wrapper used for remote commands unless `fab_shell` says otherwise.
pub const DEFAULT_SHELL: &str = r#"/bin/bash -l -c "%s""#;

/// Exit code used when the run is interrupted (Ctrl+C, end-of-input at a prompt).
pub const EXIT_INTERRUPTED: i32 = 130;

/// Well-known environment keys.
pub mod keys {
    /// Version of this tool.
    pub const VERSION: &str = "fab_version";
    /// Author of this tool.
    pub const AUTHOR: &str = "fab_author";
    /// Name of the execution strategy.
    pub const MODE: &str = "fab_mode";
    /// Default SSH port.
    pub const PORT: &str = "fab_port";
    /// Default remote identity.
    pub const USER: &str = "fab_user";
    /// Password used for authentication and `sudo -S`.
    pub const PASSWORD: &str = "fab_password";
    /// Private key file handed to the transport.
    pub const KEY_FILENAME: &str = "fab_key_filename";
    /// Host key policy (`accept` or anything else for strict).
    pub const NEW_HOST_KEY: &str = "fab_new_host_key";
    /// Shell template wrapping remote commands.
    pub const SHELL: &str = "fab_shell";
    /// Start time of the run.
    pub const TIMESTAMP: &str = "fab_timestamp";
    /// Print the fully wrapped sudo command instead of the user's command.
    pub const PRINT_REAL_SUDO: &str = "fab_print_real_sudo";
    /// Default failure policy.
    pub const FAIL: &str = "fab_fail";
    /// Target host list.
    pub const HOSTS: &str = "fab_hosts";
    /// Hostname of the host being worked on.
    pub const HOST: &str = "fab_host";
    /// Name of the command currently running.
    pub const CUR_COMMAND: &str = "fab_cur_command";
    /// Name of the operation currently running.
    pub const CURRENT_OPERATION: &str = "fab_current_operation";
    /// Suffix appended to the password prompt.
    pub const PASSPROMPT_SUFFIX: &str = "fab_passprompt_suffix";
    /// Set to true once connections are established.
    pub const CONNECTED: &str = "fab_connected";
    /// Optional cap on fan-out worker threads.
    pub const FANOUT_LIMIT: &str = "fab_fanout_limit";
}
