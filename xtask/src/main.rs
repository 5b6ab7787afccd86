//! Custom build steps for the adapter workspace.
//!
//! The `cvad` feature changes which code is compiled into `cvart`, so `build`, `check`, `clippy`
//! and `test` are run twice: once without and once with `--features cvart/cvad`.

use std::{
    env,
    path::PathBuf,
    process::{Command, exit},
};

/// Which feature configuration of `cvart` a step is run with.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Config {
    Default,
    Debug,
}

/// A build step for the workspace.
#[derive(Debug)]
struct WorkspaceAction<'a> {
    /// The tool we will invoke. Usually cargo.
    tool: String,
    /// Arguments to the above tool.
    tool_args: Vec<&'a str>,
    /// The path to the workspace we will work in.
    workspace_dir: PathBuf,
    /// Arguments appended after `tool_args`.
    target_args: Vec<&'a str>,
}

impl<'a> WorkspaceAction<'a> {
    fn new(config: Config, target: &'a str) -> Result<Self, String> {
        let mut tool = env::var("CARGO").map_err(|_| "CARGO is not set".to_owned())?;
        let mut target_args = vec![target];
        let mut tool_args = Vec::new();

        match target {
            "audit" | "clean" => (),
            "build" | "check" | "clippy" | "test" => {
                target_args.push("--workspace");
                if config == Config::Debug {
                    target_args.extend(["--features", "cvart/cvad"]);
                }
            }
            "fmt" => {
                // `cargo fmt` doesn't work for linked toolchains, so go via the rustup wrapper.
                tool = "rustup".to_owned();
                tool_args.extend(["run", "nightly", "cargo"]);
            }
            _ => return Err(format!("the build system does not support the {target} target")),
        }

        let this_dir =
            env::var("CARGO_MANIFEST_DIR").map_err(|_| "CARGO_MANIFEST_DIR is not set")?;
        Ok(Self {
            tool,
            tool_args,
            workspace_dir: [&this_dir, ".."].iter().collect::<PathBuf>(),
            target_args,
        })
    }

    fn run(self, extra_args: &[String]) -> Result<(), String> {
        let status = Command::new(&self.tool)
            .current_dir(self.workspace_dir)
            .args(self.tool_args)
            .args(self.target_args)
            .args(extra_args)
            .status()
            .map_err(|e| format!("unable to run {}: {e}", self.tool))?;

        if !status.success() {
            let pb = PathBuf::from(&self.tool);
            let base = pb
                .file_name()
                .and_then(|x| x.to_str())
                .unwrap_or(&self.tool);
            return Err(format!("{base} failed with exit code {status}"));
        }
        Ok(())
    }
}

fn bail(err_str: String) -> ! {
    eprintln!("xtask: {err_str}");
    exit(1);
}

fn main() {
    let mut args = env::args().skip(1);
    let target = args
        .next()
        .unwrap_or_else(|| bail("no target specified".to_owned()));
    let extra_args = args.collect::<Vec<_>>();

    let configs: &[Config] = match target.as_str() {
        "build" | "check" | "clippy" | "test" => &[Config::Default, Config::Debug],
        _ => &[Config::Default],
    };
    for config in configs {
        let act = WorkspaceAction::new(*config, &target).unwrap_or_else(|e| bail(e));
        act.run(&extra_args).unwrap_or_else(|e| bail(e));
    }
}
