use std::{ffi::OsString, net::SocketAddr, path::PathBuf};

use avocado_job::Settings;
use clap::{Args, Parser, Subcommand};
use serde_derive::Serialize;

/// Avocado test framework
///
/// Resolves test references, runs them in isolation and records the results
/// in a job directory.
#[derive(Parser)]
#[clap(name = "avocado", version)]
pub struct Cli {
    /// Settings file laid over the user's avocado.toml. Must exist.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// What to show on the console: none, app, early, test, job, or
    /// <stream>[:<level>]. May be repeated or comma separated.
    #[clap(long, global = true, value_delimiter = ',')]
    pub show: Vec<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs one or more tests.
    #[clap(arg_required_else_help = true)]
    Run(RunArgs),
    /// Lists the tests references resolve to.
    List(ListArgs),
    /// Runs the runner application in this process.
    #[clap(hide = true)]
    Runner {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
}

#[derive(Args, Serialize, Debug, Default)]
pub struct RunArgs {
    /// Test references: files, directories, `file:Class.method` or recipes.
    #[clap(required = true)]
    pub references: Vec<String>,

    /// Directory under which job directories are created.
    #[clap(long)]
    pub job_results_dir: Option<PathBuf>,

    /// Skips collecting system information before and after the job.
    #[clap(long)]
    pub disable_sysinfo: bool,

    /// Test runner to use. Only `nrunner` is supported.
    #[clap(long)]
    pub test_runner: Option<String>,

    /// Upper bound on tasks running at once. Defaults to the number of CPUs.
    #[clap(long)]
    pub max_parallel_tasks: Option<usize>,

    /// Interrupts the job after this long, e.g. `90`, `30s`, `5m`, `1h`.
    #[clap(long)]
    pub job_timeout: Option<String>,

    /// Stops admitting tests after the first failure.
    #[clap(long)]
    pub failfast: bool,

    /// Resolves and records every test as cancelled without running it.
    #[clap(long)]
    pub dry_run: bool,

    /// Keeps the job's temporary directory.
    #[clap(long)]
    pub keep_tmp: bool,

    /// Warns about references that resolve to nothing instead of failing.
    #[clap(long)]
    pub ignore_missing_references: bool,

    /// Also writes the JSON results to this file, `-` for stdout.
    #[clap(long, value_name = "FILE")]
    pub json: Option<String>,

    /// Also writes the xUnit results to this file, `-` for stdout.
    #[clap(long, value_name = "FILE")]
    pub xunit: Option<String>,

    /// Also writes the TAP results to this file, `-` for stdout.
    #[clap(long, value_name = "FILE")]
    pub tap: Option<String>,

    /// Also writes the TMT results to this file, `-` for stdout.
    #[clap(long, value_name = "FILE")]
    pub tmt: Option<String>,

    /// Writes an HTML report to this file.
    #[clap(long, value_name = "FILE")]
    pub html: Option<PathBuf>,

    /// Address the status server listens on.
    #[clap(long)]
    pub status_server_listen: Option<SocketAddr>,

    /// Address tasks report to. Used to listen too when no listen address is given.
    #[clap(long)]
    pub status_server_uri: Option<String>,

    /// Refuses to pick a status server address automatically.
    #[clap(long)]
    pub status_server_disable_auto: bool,

    /// How tasks are isolated: `process` or `podman`.
    #[clap(long)]
    pub nrunner_spawner: Option<String>,
}

impl RunArgs {
    /// Lays the command line over `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        let run = &mut settings.run;
        if let Some(dir) = &self.job_results_dir {
            run.results_dir = Some(dir.clone());
        }
        if let Some(test_runner) = &self.test_runner {
            run.test_runner = test_runner.clone();
        }
        if self.max_parallel_tasks.is_some() {
            run.max_parallel_tasks = self.max_parallel_tasks;
        }
        if self.job_timeout.is_some() {
            run.job_timeout = self.job_timeout.clone();
        }
        run.failfast |= self.failfast;
        run.dry_run |= self.dry_run;
        run.keep_tmp |= self.keep_tmp;
        run.ignore_missing_references |= self.ignore_missing_references;

        if self.disable_sysinfo {
            settings.sysinfo.enabled = false;
        }

        let output = &mut settings.output;
        for (flag, setting) in [
            (&self.json, &mut output.json),
            (&self.xunit, &mut output.xunit),
            (&self.tap, &mut output.tap),
            (&self.tmt, &mut output.tmt),
        ] {
            if flag.is_some() {
                *setting = flag.clone();
            }
        }
        if self.html.is_some() {
            output.html = self.html.clone();
        }

        let server = &mut settings.status_server;
        if self.status_server_listen.is_some() {
            server.listen = self.status_server_listen;
        }
        if self.status_server_uri.is_some() {
            server.uri = self.status_server_uri.clone();
        }
        server.disable_auto |= self.status_server_disable_auto;

        if let Some(spawner) = &self.nrunner_spawner {
            settings.spawner.name = spawner.clone();
        }
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Test references to resolve.
    pub references: Vec<String>,

    /// Adds tags, a summary by type and the references nothing resolved.
    #[clap(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["avocado", "run"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Run(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn flags_override_settings() {
        let args = run_args(&[
            "--job-results-dir",
            "/tmp/results",
            "--max-parallel-tasks=4",
            "--job-timeout=1s",
            "--failfast",
            "--disable-sysinfo",
            "--json",
            "-",
            "--html",
            "report.html",
            "--status-server-listen",
            "127.0.0.1:8080",
            "--nrunner-spawner",
            "podman",
            "a.sh",
            "b.py",
        ]);
        assert_eq!(args.references, ["a.sh", "b.py"]);

        let mut settings = Settings::default();
        args.apply(&mut settings);
        assert_eq!(settings.run.results_dir, Some(PathBuf::from("/tmp/results")));
        assert_eq!(settings.run.max_parallel_tasks, Some(4));
        assert_eq!(settings.run.job_timeout.as_deref(), Some("1s"));
        assert!(settings.run.failfast);
        assert!(!settings.run.dry_run);
        assert!(!settings.sysinfo.enabled);
        assert_eq!(settings.output.json.as_deref(), Some("-"));
        assert_eq!(settings.output.xunit, None);
        assert_eq!(settings.output.html, Some(PathBuf::from("report.html")));
        assert_eq!(
            settings.status_server.listen,
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(settings.spawner.name, "podman");
    }

    #[test]
    fn absent_flags_keep_settings() {
        let mut settings = Settings::default();
        settings.run.keep_tmp = true;
        settings.run.job_timeout = Some("5m".to_string());
        settings.output.tap = Some("out.tap".to_string());

        run_args(&["a.sh"]).apply(&mut settings);
        assert!(settings.run.keep_tmp);
        assert_eq!(settings.run.job_timeout.as_deref(), Some("5m"));
        assert_eq!(settings.output.tap.as_deref(), Some("out.tap"));
        assert_eq!(settings.spawner.name, "process");
    }

    #[test]
    fn show_is_global_and_comma_separated() {
        let cli = Cli::try_parse_from(["avocado", "list", "--show=app,job", "x"]).unwrap();
        assert_eq!(cli.show, ["app", "job"]);
    }

    #[test]
    fn runner_arguments_pass_through() {
        let cli = Cli::try_parse_from(["avocado", "runner", "runnable-run", "-k", "noop"]).unwrap();
        match cli.command {
            Command::Runner { args } => assert_eq!(args, ["runnable-run", "-k", "noop"]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn run_requires_references() {
        assert!(Cli::try_parse_from(["avocado", "run", "--failfast"]).is_err());
    }
}
