use crate::config::LaunchSpec;
use crate::error::SupervisorError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_MEMORY_MB: u32 = 2048;

#[cfg(windows)]
const JAVA_BINARY: &str = "java.exe";
#[cfg(not(windows))]
const JAVA_BINARY: &str = "java";

/// Command line composition for a jar-based server
///
/// The jar is always an explicit, existing file; it is never discovered by
/// scanning the install directory.
#[derive(Debug, Clone, PartialEq)]
pub struct JavaServerLaunch {
    jar: PathBuf,
    java: Option<PathBuf>,
    jvm_args: String,
    memory_mb: u32,
    env: HashMap<String, String>,
}

impl JavaServerLaunch {
    pub fn new(jar: impl Into<PathBuf>) -> Self {
        Self {
            jar: jar.into(),
            java: None,
            jvm_args: String::new(),
            memory_mb: DEFAULT_MEMORY_MB,
            env: HashMap::new(),
        }
    }

    /// Java executable, or a Java installation directory containing `bin/java`
    pub fn java(mut self, java: impl Into<PathBuf>) -> Self {
        self.java = Some(java.into());
        self
    }

    /// Whitespace separated JVM arguments; overrides the memory flags
    pub fn jvm_args(mut self, args: impl Into<String>) -> Self {
        self.jvm_args = args.into();
        self
    }

    /// Heap size used when no JVM arguments are given
    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn resolve_java(&self) -> String {
        match &self.java {
            Some(path) if !path.as_os_str().is_empty() => {
                if path.is_dir() {
                    let guessed = path.join("bin").join(JAVA_BINARY);
                    if guessed.is_file() {
                        return guessed.to_string_lossy().into_owned();
                    }
                }
                path.to_string_lossy().into_owned()
            }
            _ => "java".to_string(),
        }
    }

    fn resolve_jvm_args(&self) -> Vec<String> {
        let args: Vec<String> = self
            .jvm_args
            .split_whitespace()
            .filter(|arg| !arg.eq_ignore_ascii_case("nogui"))
            .map(str::to_string)
            .collect();

        if self.jvm_args.trim().is_empty() {
            let memory_mb = if self.memory_mb == 0 {
                DEFAULT_MEMORY_MB
            } else {
                self.memory_mb
            };
            vec![format!("-Xmx{memory_mb}M"), format!("-Xms{memory_mb}M")]
        } else {
            args
        }
    }

    /// Compose the launch spec, validating the jar path
    pub fn into_launch_spec(self) -> Result<LaunchSpec, SupervisorError> {
        if !self.jar.is_file() {
            return Err(SupervisorError::Configuration(format!(
                "server jar not found: {}",
                self.jar.display()
            )));
        }

        let jar_name = self
            .jar
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SupervisorError::Configuration(format!(
                    "server jar has no file name: {}",
                    self.jar.display()
                ))
            })?;
        let working_directory = self
            .jar
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut args = self.resolve_jvm_args();
        args.extend(["-jar".to_string(), jar_name, "nogui".to_string()]);

        Ok(LaunchSpec {
            command: self.resolve_java(),
            args,
            env: self.env,
            working_directory: Some(working_directory),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn jar_in(dir: &Path) -> PathBuf {
        let jar = dir.join("paper-1.21.jar");
        fs::write(&jar, b"PK").unwrap();
        jar
    }

    #[test]
    fn test_default_memory_flags() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JavaServerLaunch::new(jar_in(dir.path()))
            .into_launch_spec()
            .unwrap();

        assert_eq!(spec.command, "java");
        assert_eq!(
            spec.args,
            vec!["-Xmx2048M", "-Xms2048M", "-jar", "paper-1.21.jar", "nogui"]
        );
        assert_eq!(spec.working_directory.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_custom_args_drop_nogui() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JavaServerLaunch::new(jar_in(dir.path()))
            .jvm_args("-Xmx4G  NOGUI -XX:+UseG1GC nogui")
            .memory_mb(1024)
            .into_launch_spec()
            .unwrap();

        assert_eq!(
            spec.args,
            vec!["-Xmx4G", "-XX:+UseG1GC", "-jar", "paper-1.21.jar", "nogui"]
        );
    }

    #[test]
    fn test_java_directory_resolves_binary() {
        let dir = tempfile::tempdir().unwrap();
        let java_home = dir.path().join("jdk");
        fs::create_dir_all(java_home.join("bin")).unwrap();
        let binary = java_home.join("bin").join(JAVA_BINARY);
        fs::write(&binary, b"").unwrap();

        let spec = JavaServerLaunch::new(jar_in(dir.path()))
            .java(&java_home)
            .into_launch_spec()
            .unwrap();
        assert_eq!(spec.command, binary.to_string_lossy());
    }

    #[test]
    fn test_missing_jar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = JavaServerLaunch::new(dir.path().join("missing.jar"))
            .into_launch_spec()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
    }
}
