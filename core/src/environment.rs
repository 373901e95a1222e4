//! Language profiles: how each language is compiled and run, and where its files live
//! inside the sandbox.

use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::sandbox::{SandboxKind, SandboxParams};

/// Sandbox-relative names of the files a program touches.
/// Unset fields fall back to the field name itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileMapping {
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub compilable: Option<String>,
    pub executable: Option<String>,
}

impl FileMapping {
    pub fn input(&self) -> &str {
        self.input.as_deref().unwrap_or("stdin")
    }

    pub fn output(&self) -> &str {
        self.output.as_deref().unwrap_or("stdout")
    }

    pub fn error(&self) -> &str {
        self.error.as_deref().unwrap_or("stderr")
    }

    pub fn compilable(&self) -> &str {
        self.compilable.as_deref().unwrap_or("compilable")
    }

    pub fn executable(&self) -> &str {
        self.executable.as_deref().unwrap_or("executable")
    }

    /// Fields set in `over` win.
    pub fn merged(&self, over: &FileMapping) -> FileMapping {
        FileMapping {
            input: over.input.clone().or_else(|| self.input.clone()),
            output: over.output.clone().or_else(|| self.output.clone()),
            error: over.error.clone().or_else(|| self.error.clone()),
            compilable: over.compilable.clone().or_else(|| self.compilable.clone()),
            executable: over.executable.clone().or_else(|| self.executable.clone()),
        }
    }

    /// Renders `#{input}`, `#{output}`, `#{error}`, `#{compilable}` and `#{executable}`.
    pub fn render(&self, template: &str) -> Result<String> {
        use std::borrow::Cow;

        crate::str_interp::interp_with(template, |name| {
            let v = match name {
                "input" => self.input(),
                "output" => self.output(),
                "error" => self.error(),
                "compilable" => self.compilable(),
                "executable" => self.executable(),
                _ => return None,
            };
            Some(Cow::Borrowed(v))
        })
        .with_context(|| format!("Invalid command template: {}", template))
    }
}

/// Limits as written in the environment descriptor. Times in milliseconds, sizes in MiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentSandbox {
    pub max_processes: Option<u64>,
    pub time_limit: Option<u64>,
    pub wall_time_limit: Option<u64>,
    pub memory_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub preserve_env: Option<bool>,
    pub mirror_dirs: Option<Vec<PathBuf>>,
}

impl EnvironmentSandbox {
    /// Shallow merge: every field set in `over` replaces the one in `self`.
    pub fn merged(&self, over: &EnvironmentSandbox) -> EnvironmentSandbox {
        EnvironmentSandbox {
            max_processes: over.max_processes.or(self.max_processes),
            time_limit: over.time_limit.or(self.time_limit),
            wall_time_limit: over.wall_time_limit.or(self.wall_time_limit),
            memory_limit: over.memory_limit.or(self.memory_limit),
            stack_limit: over.stack_limit.or(self.stack_limit),
            preserve_env: over.preserve_env.or(self.preserve_env),
            mirror_dirs: over.mirror_dirs.clone().or_else(|| self.mirror_dirs.clone()),
        }
    }

    pub fn to_params(&self) -> SandboxParams {
        SandboxParams {
            time_limit: self.time_limit.map(Duration::from_millis),
            wall_time_limit: self.wall_time_limit.map(Duration::from_millis),
            memory_limit_mb: self.memory_limit,
            stack_limit_mb: self.stack_limit,
            max_processes: self.max_processes,
            preserve_env: self.preserve_env.unwrap_or(false),
            mirror_dirs: self.mirror_dirs.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationConfig {
    pub commands: Vec<String>,
    pub sandbox: Option<EnvironmentSandbox>,
}

impl CompilationConfig {
    fn base_sandbox() -> EnvironmentSandbox {
        EnvironmentSandbox {
            max_processes: None,
            time_limit: Some(10_000),
            wall_time_limit: Some(10_000),
            memory_limit: Some(512),
            stack_limit: None,
            preserve_env: Some(true),
            mirror_dirs: Some(vec![PathBuf::from("/etc"), PathBuf::from("/usr")]),
        }
    }

    /// Folds `configs` left to right over the compile defaults. Non-empty command lists
    /// replace earlier ones; sandbox settings merge field by field.
    pub fn merge<'a>(configs: impl IntoIterator<Item = Option<&'a CompilationConfig>>) -> Self {
        let mut res = CompilationConfig {
            commands: Vec::new(),
            sandbox: Some(Self::base_sandbox()),
        };
        for cfg in configs.into_iter().flatten() {
            if !cfg.commands.is_empty() {
                res.commands = cfg.commands.clone();
            }
            if let (Some(base), Some(over)) = (&res.sandbox, &cfg.sandbox) {
                res.sandbox = Some(base.merged(over));
            }
        }
        res
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    pub command: Option<String>,
    pub sandbox: Option<EnvironmentSandbox>,
}

impl ExecutionConfig {
    pub fn with_sandbox(sandbox: EnvironmentSandbox) -> Self {
        Self {
            command: None,
            sandbox: Some(sandbox),
        }
    }

    /// Like [`CompilationConfig::merge`], starting from an empty sandbox.
    pub fn merge<'a>(configs: impl IntoIterator<Item = Option<&'a ExecutionConfig>>) -> Self {
        let mut res = ExecutionConfig {
            command: None,
            sandbox: Some(EnvironmentSandbox::default()),
        };
        for cfg in configs.into_iter().flatten() {
            if cfg.command.is_some() {
                res.command = cfg.command.clone();
            }
            if let (Some(base), Some(over)) = (&res.sandbox, &cfg.sandbox) {
                res.sandbox = Some(base.merged(over));
            }
        }
        res
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentLanguage {
    pub name: String,
    #[serde(default, alias = "readable_name")]
    pub readable_name: Option<String>,
    /// Without the leading dot.
    pub extension: String,
    #[serde(default)]
    pub compilation: Option<CompilationConfig>,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub file_mapping: Option<FileMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Environment {
    pub default_file_mapping: Option<FileMapping>,
    pub default_compilation: Option<CompilationConfig>,
    pub default_execution: Option<ExecutionConfig>,
    pub languages: Vec<EnvironmentLanguage>,
    pub sandbox: SandboxKind,
}

impl Environment {
    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = fsutil::read_to_string(path).context("Cannot read environment file")?;
        Self::from_toml(&s)
            .with_context(|| format!("Invalid environment TOML: {}", path.to_string_lossy()))
    }

    pub fn language(&self, name: &str) -> Result<&EnvironmentLanguage> {
        self.languages
            .iter()
            .find(|l| l.name == name)
            .with_context(|| format!("Language '{}' not found in environment", name))
    }

    /// Resolves the language of `path`: the explicit `tag` if given, otherwise a
    /// language named after the file extension, otherwise the only language that
    /// declares that extension.
    pub fn find_language(&self, tag: Option<&str>, path: &Path) -> Result<&EnvironmentLanguage> {
        if let Some(tag) = tag {
            return self.language(tag);
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .with_context(|| format!("Cannot infer language of {}", path.to_string_lossy()))?;

        if let Ok(lang) = self.language(ext) {
            return Ok(lang);
        }
        let mut candidates = self.languages.iter().filter(|l| l.extension == ext);
        match (candidates.next(), candidates.next()) {
            (Some(lang), None) => Ok(lang),
            (None, _) => bail!("No language handles '.{}' files", ext),
            (Some(_), Some(_)) => bail!(
                "Several languages handle '.{}' files; set the language of {} explicitly",
                ext,
                path.to_string_lossy()
            ),
        }
    }

    pub fn compilation(&self, lang: &EnvironmentLanguage) -> CompilationConfig {
        CompilationConfig::merge([self.default_compilation.as_ref(), lang.compilation.as_ref()])
    }

    pub fn execution(&self, lang: &EnvironmentLanguage) -> ExecutionConfig {
        ExecutionConfig::merge([self.default_execution.as_ref(), Some(&lang.execution)])
    }

    pub fn file_mapping(&self, lang: &EnvironmentLanguage) -> FileMapping {
        let base = self.default_file_mapping.clone().unwrap_or_default();
        match &lang.file_mapping {
            Some(over) => base.merged(over),
            None => base,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ENV_TOML: &str = r#"
sandbox = "permissive"

[defaultFileMapping]
executable = "prog"

[defaultExecution.sandbox]
memoryLimit = 256
preserveEnv = false

[[languages]]
name = "cpp"
readableName = "C++17"
extension = "cpp"
compilation = { commands = ["g++ -O2 #{compilable} -o #{executable}"] }
execution = { command = "./#{executable}" }
fileMapping = { compilable = "main.cpp" }

[[languages]]
name = "py"
extension = "py"
execution = { command = "python3 #{executable}", sandbox = { memoryLimit = 1024 } }

[[languages]]
name = "sh"
extension = "sh"
execution = { command = "sh #{executable}" }

[[languages]]
name = "bash"
extension = "sh"
execution = { command = "bash #{executable}" }

[[languages]]
name = "c"
extension = "c"
execution = { command = "./#{executable}" }
"#;

    fn env() -> Environment {
        Environment::from_toml(ENV_TOML).unwrap()
    }

    #[test]
    fn parses_descriptor() {
        let env = env();
        assert_eq!(env.sandbox, SandboxKind::Permissive);
        assert_eq!(env.languages.len(), 5);
        assert_eq!(env.languages[0].readable_name.as_deref(), Some("C++17"));
    }

    #[test]
    fn language_lookup() {
        let env = env();
        assert_eq!(env.find_language(Some("py"), Path::new("a.cpp")).unwrap().name, "py");
        assert_eq!(env.find_language(None, Path::new("sol.cpp")).unwrap().name, "cpp");
        // a language named after the extension wins
        assert_eq!(env.find_language(None, Path::new("gen.sh")).unwrap().name, "sh");
        assert!(env.find_language(None, Path::new("x.rs")).is_err());
        assert!(env.find_language(None, Path::new("Makefile")).is_err());
        assert!(env.find_language(Some("java"), Path::new("a.java")).is_err());
    }

    #[test]
    fn extension_shared_by_several_languages_is_ambiguous() {
        let mut env = env();
        for l in &mut env.languages {
            if l.name == "sh" {
                l.name = "posix-sh".to_owned();
            }
        }
        assert!(env.find_language(None, Path::new("gen.sh")).is_err());
    }

    #[test]
    fn compilation_falls_back_to_defaults() {
        let env = env();
        let cpp = env.compilation(env.language("cpp").unwrap());
        assert_eq!(cpp.commands, ["g++ -O2 #{compilable} -o #{executable}"]);
        let sb = cpp.sandbox.unwrap();
        assert_eq!(sb.time_limit, Some(10_000));
        assert_eq!(sb.wall_time_limit, Some(10_000));
        assert_eq!(sb.memory_limit, Some(512));
        assert_eq!(sb.preserve_env, Some(true));

        let params = sb.to_params();
        assert_eq!(params.time_limit, Some(Duration::from_secs(10)));
        assert!(params.preserve_env);
        assert_eq!(params.mirror_dirs.len(), 2);

        let py = env.compilation(env.language("py").unwrap());
        assert!(py.commands.is_empty());
    }

    #[test]
    fn execution_merges_sandbox_shallowly() {
        let env = env();
        let cpp = env.execution(env.language("cpp").unwrap());
        assert_eq!(cpp.command.as_deref(), Some("./#{executable}"));
        assert_eq!(cpp.sandbox.as_ref().unwrap().memory_limit, Some(256));

        let py = env.execution(env.language("py").unwrap());
        let sb = py.sandbox.unwrap();
        assert_eq!(sb.memory_limit, Some(1024));
        assert_eq!(sb.preserve_env, Some(false));

        let over = ExecutionConfig::with_sandbox(EnvironmentSandbox {
            time_limit: Some(2000),
            ..Default::default()
        });
        let merged = ExecutionConfig::merge([Some(&py_exec(&env)), Some(&over)]);
        let sb = merged.sandbox.unwrap();
        assert_eq!(merged.command.as_deref(), Some("python3 #{executable}"));
        assert_eq!(sb.time_limit, Some(2000));
        assert_eq!(sb.memory_limit, Some(1024));
    }

    fn py_exec(env: &Environment) -> ExecutionConfig {
        env.execution(env.language("py").unwrap())
    }

    #[test]
    fn file_mapping_layers() {
        let env = env();
        let m = env.file_mapping(env.language("cpp").unwrap());
        assert_eq!(m.compilable(), "main.cpp");
        assert_eq!(m.executable(), "prog");
        assert_eq!(m.input(), "stdin");
        assert_eq!(
            m.render("g++ #{compilable} -o #{executable} < #{input}").unwrap(),
            "g++ main.cpp -o prog < stdin"
        );
        assert!(m.render("#{nope}").is_err());

        let plain = FileMapping::default();
        assert_eq!(plain.output(), "stdout");
        assert_eq!(plain.error(), "stderr");
    }

    #[test]
    fn rejects_unknown_sandbox_fields() {
        let res: std::result::Result<EnvironmentSandbox, _> = toml::from_str("timelimit = 3");
        assert!(res.is_err());
    }
}
