//! Danger pattern gating for generated code and commands
//!
//! Scans code, commands, and file operations against a regex pattern set
//! before anything executes. The result's level is the maximum over all
//! matches; High and Critical matches block execution when the
//! corresponding block flags are set.

use crate::config::DangerConfig;
use crate::{NocturnalError, Result};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl DangerLevel {
    pub fn parse(value: &str) -> DangerLevel {
        match value.to_lowercase().as_str() {
            "low" => DangerLevel::Low,
            "medium" => DangerLevel::Medium,
            "high" => DangerLevel::High,
            "critical" => DangerLevel::Critical,
            _ => DangerLevel::Medium,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DangerPattern {
    pub name: String,
    pub pattern: String,
    pub danger_level: DangerLevel,
    pub description: String,
    pub category: String,
    pub enabled: bool,
    regex: Regex,
}

impl DangerPattern {
    pub fn new(
        name: &str,
        pattern: &str,
        danger_level: DangerLevel,
        description: &str,
        category: &str,
    ) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                NocturnalError::Validation(format!("danger pattern {name:?} does not compile: {e}"))
            })?;
        Ok(Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            danger_level,
            description: description.to_string(),
            category: category.to_string(),
            enabled: true,
            regex,
        })
    }
}

/// Result of one danger scan
#[derive(Debug, Clone, Serialize)]
pub struct DangerDetection {
    pub is_dangerous: bool,
    pub danger_level: DangerLevel,
    pub detected_patterns: Vec<String>,
    pub risk_description: String,
    pub recommended_action: String,
    pub blocked_operations: Vec<String>,
}

impl DangerDetection {
    fn safe() -> Self {
        Self {
            is_dangerous: false,
            danger_level: DangerLevel::Safe,
            detected_patterns: Vec::new(),
            risk_description: "No dangerous patterns detected".to_string(),
            recommended_action: "Proceed".to_string(),
            blocked_operations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionStats {
    pub total_checks: u64,
    pub dangers_detected: u64,
    pub operations_blocked: u64,
    pub pattern_matches: HashMap<String, u64>,
}

pub struct DangerDetector {
    block_on_high_danger: bool,
    block_on_critical_danger: bool,
    protected_paths: Vec<String>,
    critical_system_paths: Vec<String>,
    patterns: RwLock<Vec<DangerPattern>>,
    stats: Mutex<DetectionStats>,
}

impl DangerDetector {
    pub fn new(config: &DangerConfig) -> Result<Self> {
        let mut patterns = builtin_patterns()?;

        for custom in &config.custom_patterns {
            if !custom.enabled {
                continue;
            }
            let mut pattern = DangerPattern::new(
                &custom.name,
                &custom.pattern,
                DangerLevel::parse(&custom.danger_level),
                "",
                if custom.category.is_empty() {
                    "custom"
                } else {
                    &custom.category
                },
            )?;
            pattern.enabled = custom.enabled;
            patterns.push(pattern);
        }

        Ok(Self {
            block_on_high_danger: config.block_on_high_danger,
            block_on_critical_danger: config.block_on_critical_danger,
            protected_paths: config.protected_paths.clone(),
            critical_system_paths: config.critical_system_paths.clone(),
            patterns: RwLock::new(patterns),
            stats: Mutex::new(DetectionStats::default()),
        })
    }

    /// Scan generated code for dangerous patterns.
    pub fn analyze_code(&self, code: &str) -> DangerDetection {
        self.scan(code)
    }

    /// Scan a shell command; same pattern set as code.
    pub fn analyze_command(&self, command: &str) -> DangerDetection {
        self.scan(command)
    }

    /// Analyze a file operation against protected and critical paths.
    pub fn analyze_file_operation(&self, operation: &str, file_path: &str) -> DangerDetection {
        self.bump_checks();

        let mut detected = Vec::new();
        let mut level = DangerLevel::Safe;
        let mut blocked = Vec::new();

        if self.is_protected_path(file_path)
            && matches!(operation, "delete" | "overwrite" | "modify")
        {
            level = level.max(DangerLevel::High);
            detected.push("protected_path_modification".to_string());
            if self.should_block(DangerLevel::High) {
                blocked.push(format!("{operation} {file_path}"));
            }
        }

        if self.is_critical_system_path(file_path) {
            level = level.max(DangerLevel::Critical);
            detected.push("critical_system_path_access".to_string());
            blocked.push(format!("{operation} {file_path}"));
        }

        if (file_path.contains('*') || file_path.ends_with('/')) && operation == "delete" {
            level = level.max(DangerLevel::Medium);
            detected.push("bulk_file_deletion".to_string());
        }

        self.finish_detection(detected, level, blocked)
    }

    pub fn add_pattern(&self, pattern: DangerPattern) {
        if let Ok(mut patterns) = self.patterns.write() {
            debug!("Adding danger pattern: {}", pattern.name);
            patterns.push(pattern);
        }
    }

    pub fn remove_pattern(&self, name: &str) -> bool {
        if let Ok(mut patterns) = self.patterns.write() {
            let before = patterns.len();
            patterns.retain(|p| p.name != name);
            return patterns.len() < before;
        }
        false
    }

    pub fn set_pattern_enabled(&self, name: &str, enabled: bool) -> bool {
        if let Ok(mut patterns) = self.patterns.write() {
            if let Some(pattern) = patterns.iter_mut().find(|p| p.name == name) {
                pattern.enabled = enabled;
                return true;
            }
        }
        false
    }

    pub fn list_patterns(&self) -> Vec<(String, DangerLevel, String, bool)> {
        self.patterns
            .read()
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|p| {
                        (
                            p.name.clone(),
                            p.danger_level,
                            p.category.clone(),
                            p.enabled,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn enabled_pattern_count(&self) -> usize {
        self.patterns
            .read()
            .map(|patterns| patterns.iter().filter(|p| p.enabled).count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn scan(&self, input: &str) -> DangerDetection {
        self.bump_checks();

        let mut detected = Vec::new();
        let mut level = DangerLevel::Safe;
        let mut blocked = Vec::new();

        if let Ok(patterns) = self.patterns.read() {
            for pattern in patterns.iter().filter(|p| p.enabled) {
                let matches: Vec<&str> =
                    pattern.regex.find_iter(input).map(|m| m.as_str()).collect();
                if matches.is_empty() {
                    continue;
                }

                detected.push(pattern.name.clone());
                level = level.max(pattern.danger_level);

                if let Ok(mut stats) = self.stats.lock() {
                    *stats
                        .pattern_matches
                        .entry(pattern.name.clone())
                        .or_insert(0) += matches.len() as u64;
                }

                if self.should_block(pattern.danger_level) {
                    blocked.extend(matches.iter().map(|m| m.to_string()));
                }
            }
        }

        self.finish_detection(detected, level, blocked)
    }

    fn finish_detection(
        &self,
        detected: Vec<String>,
        level: DangerLevel,
        blocked: Vec<String>,
    ) -> DangerDetection {
        if detected.is_empty() {
            return DangerDetection::safe();
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.dangers_detected += 1;
            if !blocked.is_empty() {
                stats.operations_blocked += 1;
            }
        }

        let risk_description = format!(
            "{} dangerous pattern(s) detected, highest level {:?}: {}",
            detected.len(),
            level,
            detected.join(", ")
        );
        let recommended_action = match level {
            DangerLevel::Critical => "Block execution and require manual approval".to_string(),
            DangerLevel::High => "Block execution pending review".to_string(),
            DangerLevel::Medium => "Review before applying".to_string(),
            _ => "Proceed with caution".to_string(),
        };

        if !blocked.is_empty() {
            warn!("Dangerous operations blocked: {:?}", blocked);
        }

        DangerDetection {
            is_dangerous: true,
            danger_level: level,
            detected_patterns: detected,
            risk_description,
            recommended_action,
            blocked_operations: blocked,
        }
    }

    fn should_block(&self, level: DangerLevel) -> bool {
        (level == DangerLevel::High && self.block_on_high_danger)
            || (level == DangerLevel::Critical && self.block_on_critical_danger)
    }

    fn is_protected_path(&self, file_path: &str) -> bool {
        let normalized = file_path.trim_start_matches("./");
        self.protected_paths.iter().any(|protected| {
            if protected.ends_with('/') {
                normalized.starts_with(protected.trim_end_matches('/'))
            } else {
                normalized == protected
                    || Path::new(normalized)
                        .file_name()
                        .map(|name| name.to_string_lossy() == *protected)
                        .unwrap_or(false)
            }
        })
    }

    fn is_critical_system_path(&self, file_path: &str) -> bool {
        self.critical_system_paths
            .iter()
            .any(|critical| file_path.starts_with(critical.as_str()))
    }

    fn bump_checks(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.total_checks += 1;
        }
    }
}

fn builtin_patterns() -> Result<Vec<DangerPattern>> {
    let specs: [(&str, &str, DangerLevel, &str, &str); 21] = [
        (
            "rm_recursive",
            r"\brm\s+(-\w*[rf]\w*\s+)+(/|\*|~)",
            DangerLevel::Critical,
            "Recursive filesystem deletion",
            "filesystem",
        ),
        (
            "format_drive",
            r"\bformat\s+[a-z]:|diskutil\s+eraseDisk|mkfs\.",
            DangerLevel::Critical,
            "Drive formatting command",
            "filesystem",
        ),
        (
            "dd_raw_device",
            r"\bdd\s+.*of=/dev/",
            DangerLevel::Critical,
            "Raw write to a block device",
            "filesystem",
        ),
        (
            "chmod_world_writable",
            r"\bchmod\s+(-R\s+)?777\s+/",
            DangerLevel::High,
            "World-writable permissions on system directories",
            "filesystem",
        ),
        (
            "chown_recursive_root",
            r"\bchown\s+-R\s+\S+\s+/\s*$",
            DangerLevel::High,
            "Recursive ownership change from the filesystem root",
            "filesystem",
        ),
        (
            "curl_pipe_shell",
            r"curl\s+[^|\n]*\|\s*(bash|sh)\b|wget\s+[^|\n]*\|\s*(bash|sh)\b",
            DangerLevel::High,
            "Downloading and executing remote scripts",
            "network",
        ),
        (
            "nc_backdoor",
            r"\b(nc|netcat)\s+.*-[el]+.*\d+.*(sh|bash)\b",
            DangerLevel::Critical,
            "Network backdoor via netcat",
            "network",
        ),
        (
            "firewall_flush",
            r"\biptables\s+(-F|--flush)",
            DangerLevel::High,
            "Flushing firewall rules",
            "network",
        ),
        (
            "sudoers_modification",
            r"echo\s+.*>>\s*/etc/sudoers|\bvisudo\b",
            DangerLevel::Critical,
            "Modifying sudo configuration",
            "system",
        ),
        (
            "crontab_modification",
            r"crontab\s+-[er]|echo\s+.*>>\s*/etc/crontab",
            DangerLevel::High,
            "Modifying scheduled tasks",
            "system",
        ),
        (
            "service_manipulation",
            r"systemctl\s+disable|service\s+\S+\s+stop|launchctl\s+unload",
            DangerLevel::High,
            "Disabling system services",
            "system",
        ),
        (
            "fork_bomb",
            r":\(\)\s*\{\s*:\|:&\s*\}\s*;",
            DangerLevel::Critical,
            "Shell fork bomb",
            "system",
        ),
        (
            "eval_injection",
            r"\beval\s*\(\s*[\x22'].*user|exec\s*\(\s*[\x22'].*input",
            DangerLevel::High,
            "Code injection via eval/exec",
            "code",
        ),
        (
            "sql_injection_shape",
            r"execute\s*\(\s*[\x22'].*%s|query\s*\(\s*[\x22'].*\+",
            DangerLevel::High,
            "String-built SQL statement",
            "code",
        ),
        (
            "hardcoded_secrets",
            r#"password\s*=\s*["'][^"']{8,}["']|api[_-]?key\s*=\s*["'][^"']{16,}["']"#,
            DangerLevel::Medium,
            "Hardcoded secrets in code",
            "security",
        ),
        (
            "crypto_key_generation",
            r"openssl\s+genrsa|ssh-keygen\s+.*-f\s*/|gpg\s+--gen-key",
            DangerLevel::Medium,
            "Cryptographic key generation",
            "security",
        ),
        (
            "database_drop",
            r"DROP\s+DATABASE|DELETE\s+FROM\s+\*|TRUNCATE\s+TABLE",
            DangerLevel::Critical,
            "Database destruction statement",
            "database",
        ),
        (
            "kill_critical_processes",
            r"pkill\s+-9|killall\s+.*ssh|kill\s+-9\s+1\b",
            DangerLevel::High,
            "Killing critical system processes",
            "process",
        ),
        (
            "git_force_operations",
            r"git\s+push\s+.*--force|git\s+reset\s+--hard\s+HEAD~\d+",
            DangerLevel::Medium,
            "Destructive git operations",
            "git",
        ),
        (
            "git_clean_force",
            r"git\s+clean\s+-[fxd]+",
            DangerLevel::Medium,
            "Aggressive git cleanup",
            "git",
        ),
        (
            "path_poisoning",
            r#"export\s+PATH\s*=\s*["']?/tmp|PATH\s*=\s*["']?/var/tmp"#,
            DangerLevel::Medium,
            "PATH pointed at world-writable directories",
            "environment",
        ),
    ];

    specs
        .iter()
        .map(|(name, pattern, level, description, category)| {
            DangerPattern::new(name, pattern, *level, description, category)
        })
        .collect()
}
