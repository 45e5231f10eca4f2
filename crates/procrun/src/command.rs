//! Command normalization.
//!
//! Every accepted call shape (positional arguments, positional arguments with
//! trailing options, or a standalone descriptor) resolves to one canonical
//! [`Command`]. The caller's [`CommandOptions`] is only ever borrowed; the
//! command owns fresh copies of everything it keeps.

use crate::error::ValidationError;

/// Caller-supplied options. Every field is optional.
///
/// Used as the trailing options of a positional call, or on its own as a
/// descriptor (in which case `argv` must be non-empty).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Arguments appended after any positional arguments.
    pub argv: Vec<String>,
    /// Working directory. `None` inherits the engine's.
    pub dir: Option<String>,
    /// Whether a non-successful exit becomes an error. Defaults to `true`.
    pub throw_on_failure: Option<bool>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_throw_on_failure(mut self, throw_on_failure: bool) -> Self {
        self.throw_on_failure = Some(throw_on_failure);
        self
    }
}

/// Canonical, validated launch request.
///
/// `argv` always has at least one element; `argv[0]` is the executable.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
    dir: Option<String>,
    throw_on_failure: bool,
}

impl Command {
    /// Positional form: `args` form the base argv, `options.argv` is appended.
    pub fn from_args<I, S>(args: I, options: Option<&CommandOptions>) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv: Vec<String> = args.into_iter().map(Into::into).collect();

        let (dir, throw_on_failure) = match options {
            Some(options) => {
                argv.extend(options.argv.iter().cloned());
                (options.dir.clone(), options.throw_on_failure)
            }
            None => (None, None),
        };

        if argv.is_empty() {
            return Err(ValidationError::EmptyArgv);
        }

        Ok(Self {
            argv,
            dir,
            throw_on_failure: throw_on_failure.unwrap_or(true),
        })
    }

    /// Descriptor form: `options.argv` must name the executable.
    pub fn from_options(options: &CommandOptions) -> Result<Self, ValidationError> {
        Self::from_args(std::iter::empty::<String>(), Some(options))
    }

    /// Start building a command for `program`.
    pub fn builder(program: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            args: vec![program.into()],
            options: CommandOptions::default(),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        // argv is never empty after construction
        &self.argv[0]
    }

    pub fn dir(&self) -> Option<&str> {
        self.dir.as_deref()
    }

    pub fn throw_on_failure(&self) -> bool {
        self.throw_on_failure
    }
}

/// Builder for the positional form.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    args: Vec<String>,
    options: CommandOptions,
}

impl CommandBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.options.dir = Some(dir.into());
        self
    }

    pub fn throw_on_failure(mut self, throw_on_failure: bool) -> Self {
        self.options.throw_on_failure = Some(throw_on_failure);
        self
    }

    pub fn build(self) -> Result<Command, ValidationError> {
        Command::from_args(self.args, Some(&self.options))
    }
}

/// Build a [`Command`] from positional arguments, optionally followed by
/// `; options`.
///
/// ```
/// use procrun::{CommandOptions, cmd};
///
/// let plain = cmd!("ls", "-l").unwrap();
/// let opts = CommandOptions::new().with_dir("/tmp");
/// let in_tmp = cmd!("ls", "-l"; opts).unwrap();
/// assert_eq!(plain.argv(), in_tmp.argv());
/// ```
#[macro_export]
macro_rules! cmd {
    ($($arg:expr),+ ; $options:expr) => {
        $crate::Command::from_args(
            [$(::std::string::String::from($arg)),+],
            ::std::option::Option::Some(&$options),
        )
    };
    ($($arg:expr),+ $(,)?) => {
        $crate::Command::from_args([$(::std::string::String::from($arg)),+], ::std::option::Option::None)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::EngineRequest;

    #[test]
    fn positional_args_become_argv() {
        let cmd = Command::from_args(["echo", "hello"], None).unwrap();

        assert_eq!(cmd.argv(), ["echo", "hello"]);
        assert_eq!(cmd.program(), "echo");
        assert_eq!(cmd.dir(), None);
        assert!(cmd.throw_on_failure());
    }

    #[test]
    fn options_argv_is_appended_after_positional() {
        let opts = CommandOptions::new().with_argv(["-n", "3"]);
        let cmd = Command::from_args(["head"], Some(&opts)).unwrap();

        assert_eq!(cmd.argv(), ["head", "-n", "3"]);
    }

    #[test]
    fn options_override_defaults() {
        let opts = CommandOptions::new()
            .with_dir("/var/tmp")
            .with_throw_on_failure(false);
        let cmd = Command::from_args(["pwd"], Some(&opts)).unwrap();

        assert_eq!(cmd.dir(), Some("/var/tmp"));
        assert!(!cmd.throw_on_failure());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = Command::from_args(std::iter::empty::<&str>(), None).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyArgv));

        let err = Command::from_options(&CommandOptions::new().with_dir("/tmp")).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyArgv));
    }

    #[test]
    fn caller_options_are_not_mutated() {
        let opts = CommandOptions::new().with_argv(["b"]).with_dir("x");
        let before = opts.clone();

        let cmd = Command::from_args(["a"], Some(&opts)).unwrap();

        assert_eq!(opts, before);
        assert_eq!(cmd.argv(), ["a", "b"]);
    }

    #[test]
    fn positional_and_descriptor_forms_encode_identically() {
        let positional =
            Command::from_args(["a", "b"], Some(&CommandOptions::new().with_dir("x"))).unwrap();
        let descriptor =
            Command::from_options(&CommandOptions::new().with_argv(["a", "b"]).with_dir("x"))
                .unwrap();

        assert_eq!(positional, descriptor);

        let left = serde_json::to_vec(&EngineRequest::run(&positional)).unwrap();
        let right = serde_json::to_vec(&EngineRequest::run(&descriptor)).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn builder_matches_positional_form() {
        let built = Command::builder("cargo")
            .arg("build")
            .args(["--release", "--locked"])
            .dir("/src")
            .throw_on_failure(false)
            .build()
            .unwrap();
        let opts = CommandOptions::new()
            .with_dir("/src")
            .with_throw_on_failure(false);
        let positional =
            Command::from_args(["cargo", "build", "--release", "--locked"], Some(&opts)).unwrap();

        assert_eq!(built, positional);
    }

    #[test]
    fn cmd_macro_accepts_trailing_options() {
        let opts = CommandOptions::new().with_argv(["c"]).with_throw_on_failure(false);

        let cmd = cmd!("a", "b"; opts).unwrap();
        assert_eq!(cmd.argv(), ["a", "b", "c"]);
        assert!(!cmd.throw_on_failure());

        let cmd = cmd!("a", String::from("b")).unwrap();
        assert_eq!(cmd.argv(), ["a", "b"]);
        assert!(cmd.throw_on_failure());
    }
}
