//! Rsync option handling
//!
//! [`CommandOptions`] maps a typed knob set onto a validated argv for the
//! rsync binary. Validation accumulates: every invalid field is reported,
//! and every flag that individually validates still appears in the argv.
//! [`TransferOptions`] layers the pod/container customization and
//! credentials on top, with chainable presets.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;
use crate::meta::{ContainerMutation, ObjectMetaMutation, PodSpecMutation};

const OPT_RECURSIVE: &str = "--recursive";
const OPT_SYM_LINKS: &str = "--links";
const OPT_PERMISSIONS: &str = "--perms";
const OPT_MOD_TIMES: &str = "--times";
const OPT_DEVICE_FILES: &str = "--devices";
const OPT_SPECIAL_FILES: &str = "--specials";
const OPT_OWNER: &str = "--owner";
const OPT_GROUP: &str = "--group";
const OPT_HARD_LINKS: &str = "--hard-links";
const OPT_PARTIAL: &str = "--partial";
const OPT_DELETE: &str = "--delete";
const OPT_HUMAN_READABLE: &str = "--human-readable";

const LOG_FILE_STDOUT: &str = "/dev/stdout";

fn info_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]+\d?$").expect("static pattern"))
}

fn extra_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-{1,2}([a-z]+-)?[a-z]+$").expect("static pattern"))
}

/// Knobs that map directly onto rsync command-line flags
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOptions {
    /// `--recursive`
    pub recursive: bool,
    /// `--links`
    pub sym_links: bool,
    /// `--perms`
    pub permissions: bool,
    /// `--times`
    pub mod_times: bool,
    /// `--devices`
    pub device_files: bool,
    /// `--specials`
    pub special_files: bool,
    /// `--group`
    pub groups: bool,
    /// `--owner`
    pub owners: bool,
    /// `--hard-links`
    pub hard_links: bool,
    /// `--delete`
    pub delete: bool,
    /// `--partial`
    pub partial: bool,
    /// `--bwlimit=<N>`; must be positive
    pub bw_limit: Option<i32>,
    /// `--human-readable`
    pub human_readable: bool,
    /// `--log-file=<path>`
    pub log_file: Option<String>,
    /// `--info=<csv>`; members must match `^[A-Z]+\d?$`
    pub info: Vec<String>,
    /// Extra flags passed through after validation against
    /// `^-{1,2}([a-z]+-)?[a-z]+$`
    pub extras: Vec<String>,
}

impl CommandOptions {
    /// Build the validated argv.
    ///
    /// Returns the flags in a stable order together with every validation
    /// failure; flags that individually validate are always present.
    pub fn as_rsync_arguments(&self) -> (Vec<String>, Vec<Error>) {
        let mut opts = Vec::new();
        let mut errs = Vec::new();

        if self.recursive {
            opts.push(OPT_RECURSIVE.to_string());
        }
        if self.sym_links {
            opts.push(OPT_SYM_LINKS.to_string());
        }
        if self.permissions {
            opts.push(OPT_PERMISSIONS.to_string());
        }
        if self.device_files {
            opts.push(OPT_DEVICE_FILES.to_string());
        }
        if self.special_files {
            opts.push(OPT_SPECIAL_FILES.to_string());
        }
        if self.mod_times {
            opts.push(OPT_MOD_TIMES.to_string());
        }
        if self.owners {
            opts.push(OPT_OWNER.to_string());
        }
        if self.groups {
            opts.push(OPT_GROUP.to_string());
        }
        if self.hard_links {
            opts.push(OPT_HARD_LINKS.to_string());
        }
        if self.delete {
            opts.push(OPT_DELETE.to_string());
        }
        if self.partial {
            opts.push(OPT_PARTIAL.to_string());
        }
        if let Some(limit) = self.bw_limit {
            if limit > 0 {
                opts.push(format!("--bwlimit={limit}"));
            } else {
                errs.push(Error::validation_for_field(
                    "bwLimit",
                    "rsync bwlimit value must be a positive integer",
                ));
            }
        }
        if self.human_readable {
            opts.push(OPT_HUMAN_READABLE.to_string());
        }
        if let Some(log_file) = &self.log_file {
            if !log_file.is_empty() {
                opts.push(format!("--log-file={log_file}"));
            }
        }
        if !self.info.is_empty() {
            let (validated, info_errs) = filter_info_options(&self.info);
            errs.extend(info_errs);
            opts.push(format!("--info={}", validated.join(",")));
        }
        if !self.extras.is_empty() {
            let (validated, extra_errs) = filter_extra_options(&self.extras);
            errs.extend(extra_errs);
            opts.extend(validated);
        }

        (opts, errs)
    }
}

fn filter_info_options(options: &[String]) -> (Vec<String>, Vec<Error>) {
    let mut validated = Vec::new();
    let mut errs = Vec::new();
    for opt in options {
        if info_pattern().is_match(opt) {
            validated.push(opt.trim().to_string());
        } else {
            errs.push(Error::validation_for_field(
                "info",
                format!("invalid value {opt} for rsync option --info"),
            ));
        }
    }
    (validated, errs)
}

fn filter_extra_options(options: &[String]) -> (Vec<String>, Vec<Error>) {
    let mut validated = Vec::new();
    let mut errs = Vec::new();
    for opt in options {
        if extra_pattern().is_match(opt) {
            validated.push(opt.clone());
        } else {
            errs.push(Error::validation_for_field(
                "extras",
                format!("invalid rsync option {opt}"),
            ));
        }
    }
    (validated, errs)
}

/// Full customization set for an rsync transfer
#[derive(Clone, Debug, Default)]
pub struct TransferOptions {
    /// Command-line knobs for the rsync invocation
    pub command: CommandOptions,
    /// Metadata stamped onto source-side objects
    pub source_pod_meta: ObjectMetaMutation,
    /// Metadata stamped onto destination-side objects
    pub destination_pod_meta: ObjectMetaMutation,
    /// Pod-spec mutations for source-side pods
    pub source_pod_mutations: Vec<PodSpecMutation>,
    /// Pod-spec mutations for destination-side pods
    pub destination_pod_mutations: Vec<PodSpecMutation>,
    /// Container mutations for source-side containers
    pub source_container_mutations: Vec<ContainerMutation>,
    /// Container mutations for destination-side containers
    pub destination_container_mutations: Vec<ContainerMutation>,

    username: Option<String>,
    password: Option<String>,
}

impl TransferOptions {
    /// Archive preset: recursion plus full attribute preservation
    pub fn archive_files(mut self, on: bool) -> Self {
        self.command.recursive = on;
        self.command.sym_links = on;
        self.command.permissions = on;
        self.command.mod_times = on;
        self.command.groups = on;
        self.command.owners = on;
        self.command.device_files = on;
        self.command.special_files = on;
        self
    }

    /// Progress preset: per-file info flags, human-readable sizes, and a
    /// log stream on stdout
    pub fn standard_progress(mut self, on: bool) -> Self {
        if on {
            self.command.info = vec![
                "COPY2", "DEL2", "REMOVE2", "SKIP2", "FLIST2", "PROGRESS2", "STATS2",
            ]
            .into_iter()
            .map(str::to_string)
            .collect();
            self.command.human_readable = true;
            self.command.log_file = Some(LOG_FILE_STDOUT.to_string());
        }
        self
    }

    /// Preserve file ownership (owner + group)
    pub fn preserve_ownership(mut self, on: bool) -> Self {
        self.command.owners = on;
        self.command.groups = on;
        self
    }

    /// Delete destination files missing from the source
    pub fn delete_destination(mut self, on: bool) -> Self {
        self.command.delete = on;
        self
    }

    /// Preserve hard links
    pub fn hard_links(mut self, on: bool) -> Self {
        self.command.hard_links = on;
        self
    }

    /// Keep partially transferred files for the next attempt
    pub fn partial(mut self, on: bool) -> Self {
        self.command.partial = on;
        self
    }

    /// Daemon auth user
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Daemon auth password; generated server-side when never supplied
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Metadata for source-side objects
    pub fn source_meta(mut self, meta: ObjectMetaMutation) -> Self {
        self.source_pod_meta = meta;
        self
    }

    /// Metadata for destination-side objects
    pub fn destination_meta(mut self, meta: ObjectMetaMutation) -> Self {
        self.destination_pod_meta = meta;
        self
    }

    /// Add a container mutation on the source side
    pub fn source_container_mutation(mut self, mutation: ContainerMutation) -> Self {
        self.source_container_mutations.push(mutation);
        self
    }

    /// Add a container mutation on the destination side
    pub fn destination_container_mutation(mut self, mutation: ContainerMutation) -> Self {
        self.destination_container_mutations.push(mutation);
        self
    }

    /// Add a pod-spec mutation on the source side
    pub fn source_pod_mutation(mut self, mutation: PodSpecMutation) -> Self {
        self.source_pod_mutations.push(mutation);
        self
    }

    /// Add a pod-spec mutation on the destination side
    pub fn destination_pod_mutation(mut self, mutation: PodSpecMutation) -> Self {
        self.destination_pod_mutations.push(mutation);
        self
    }

    /// The default transfer profile: archive semantics with progress
    /// reporting
    pub fn default_options() -> Self {
        Self::default().archive_files(true).standard_progress(true)
    }

    /// The effective daemon user
    pub fn effective_username(&self) -> &str {
        self.username.as_deref().unwrap_or(super::DEFAULT_RSYNC_USER)
    }

    /// The password, when one has been supplied or generated
    pub fn supplied_password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Record the generated password so the secret and the daemon agree
    pub(crate) fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_is_deterministic_and_ordered() {
        let opts = TransferOptions::default_options().command;
        let (argv1, errs1) = opts.as_rsync_arguments();
        let (argv2, errs2) = opts.as_rsync_arguments();
        assert_eq!(argv1, argv2);
        assert!(errs1.is_empty() && errs2.is_empty());
        assert_eq!(
            argv1,
            vec![
                "--recursive",
                "--links",
                "--perms",
                "--devices",
                "--specials",
                "--times",
                "--owner",
                "--group",
                "--human-readable",
                "--log-file=/dev/stdout",
                "--info=COPY2,DEL2,REMOVE2,SKIP2,FLIST2,PROGRESS2,STATS2",
            ]
        );
    }

    #[test]
    fn bwlimit_must_be_positive() {
        let opts = CommandOptions {
            bw_limit: Some(0),
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        assert!(argv.is_empty());
        assert_eq!(errs.len(), 1);

        let opts = CommandOptions {
            bw_limit: Some(1024),
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        assert_eq!(argv, vec!["--bwlimit=1024"]);
        assert!(errs.is_empty());
    }

    #[test]
    fn invalid_extras_are_dropped_but_reported() {
        let opts = CommandOptions {
            recursive: true,
            extras: vec!["--RM rf /".to_string()],
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        assert_eq!(argv, vec!["--recursive"]);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].to_string().contains("--RM rf /"));
    }

    #[test]
    fn valid_extras_pass_through() {
        let opts = CommandOptions {
            extras: vec![
                "--compress".to_string(),
                "-z".to_string(),
                "--one-file-system".to_string(),
            ],
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        // "--one-file-system" has two dash-joined words and fails the
        // single-hyphen pattern
        assert_eq!(argv, vec!["--compress", "-z"]);
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn info_flags_are_validated_individually() {
        let opts = CommandOptions {
            info: vec![
                "PROGRESS2".to_string(),
                "bad flag".to_string(),
                "STATS".to_string(),
            ],
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        assert_eq!(argv, vec!["--info=PROGRESS2,STATS"]);
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn validation_errors_accumulate_per_field() {
        let opts = CommandOptions {
            recursive: true,
            bw_limit: Some(-1),
            info: vec!["nope".to_string()],
            extras: vec!["--RM rf /".to_string()],
            ..Default::default()
        };
        let (argv, errs) = opts.as_rsync_arguments();
        assert_eq!(errs.len(), 3);
        assert!(argv.contains(&"--recursive".to_string()));
        let aggregate = Error::aggregate(errs).unwrap_err();
        assert_eq!(aggregate.len(), 3);
    }

    #[test]
    fn presets_compose() {
        let opts = TransferOptions::default()
            .archive_files(true)
            .delete_destination(true)
            .hard_links(true)
            .partial(true);
        assert!(opts.command.recursive);
        assert!(opts.command.delete);
        assert!(opts.command.hard_links);
        assert!(opts.command.partial);
        assert!(!opts.command.human_readable);
    }

    #[test]
    fn username_defaults_to_root() {
        let opts = TransferOptions::default();
        assert_eq!(opts.effective_username(), "root");
        let opts = opts.username("backup");
        assert_eq!(opts.effective_username(), "backup");
    }
}
