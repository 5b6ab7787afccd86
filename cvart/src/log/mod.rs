//! The implementation of the `CVA_LOG*` environment variables.
//!
//! Note that adapter disassembly logging is only meaningfully available when the `cvad` feature
//! is available: otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log adapter events (e.g. generation, installation, linking).
    AdapterEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` should default to the platform specific standard
    /// for logging (e.g. stderr).
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("CVA_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Parse a `CVA_LOG` value of the form `[<path>|-:]<level>`.
    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // If there's an existing log file, truncate (i.e. empty it), so that later
                    // appends to the log aren't appending to a previous log run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("CVA_LOG must be of the format `[<path|->:]<level>".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid CVA_LOG level '{s}': {e}"))?;
        // This unwrap can only fail dynamically if we've got the types wrong statically (i.e.
        // it'll fail as soon as this code is executed for the first time).
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("CVA_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "cva-error",
                Verbosity::Warning => "cva-warning",
                Verbosity::AdapterEvent => "cva-adapter-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Eq, Hash, PartialEq)]
#[allow(dead_code)]
pub(crate) enum AsmFormat {
    /// The assembler code of a generated adapter.
    Asm,
    /// The assembler code of an installed adapter, including instruction offsets and virtual
    /// addresses.
    AsmFull,
}

#[cfg(not(feature = "cvad"))]
mod internals {
    use super::AsmFormat;
    pub(crate) fn should_log_asm(_: AsmFormat) -> bool {
        false
    }
    pub(crate) fn log_asm(_: &str) {}
}

#[cfg(feature = "cvad")]
mod internals {
    use super::AsmFormat;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_ASM: LazyLock<Option<(String, HashSet<AsmFormat>)>> = LazyLock::new(|| {
        let mut log_formats = HashSet::new();
        if let Ok(x) = env::var("CVA_LOG_ASM") {
            let (path, formats) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, formats] => (*path, *formats),
                [formats] => ("-", *formats),
                _ => panic!("CVA_LOG_ASM must be of the format '[<path>:]<format_1>[,<format_2>]'"),
            };
            for x in formats.split(',') {
                log_formats.insert(AsmFormat::from_str(x).unwrap());
            }
            if path != "-" {
                // If there's an existing log file, truncate (i.e. empty it), so that later
                // appends to the log aren't appending to a previous log run.
                File::create(path).ok();
            }
            Some((path.to_string(), log_formats))
        } else {
            None
        }
    });

    impl AsmFormat {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "asm" => Ok(Self::Asm),
                "asm-full" => Ok(Self::AsmFull),
                _ => Err(format!("Invalid CVA_LOG_ASM value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_asm(format: AsmFormat) -> bool {
        if let Some(true) = LOG_ASM.as_ref().map(|(_, formats)| formats.contains(&format)) {
            return true;
        }
        false
    }

    pub(crate) fn log_asm(s: &str) {
        match LOG_ASM.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_asm, should_log_asm};
