use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flakrs::cli::{self, BuildMeta};
use flakrs::collector::CollectorConfig;
use flakrs::flaky::FlakyQueryOptions;
use flakrs::ingest::jenkins::JenkinsClient;
use flakrs::queries::{FailedTestsQuery, TestStatusMask};
use flakrs::store::EsStore;

/// flakrs — CI build/test result queries and flaky-test detection over a
/// search index.
#[derive(Parser)]
#[command(name = "flakrs", version, about)]
struct Cli {
    /// Base URL of the search store.
    #[arg(long, global = true, default_value = "http://localhost:9200")]
    store_url: String,

    /// Index (or index pattern) to search.
    #[arg(long, global = true, default_value = "build_results*")]
    index: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect flaky tests across repeated runs in a time window.
    Flaky {
        /// Start of the window (store date expression, e.g. "now-7d").
        #[arg(long, default_value = "now-7d")]
        start_date: String,

        /// End of the window.
        #[arg(long, default_value = "now")]
        end_date: String,

        /// Restrict to one collector.
        #[arg(long)]
        collector: Option<String>,

        /// Restrict to one job name; `*` wildcards allowed.
        #[arg(long)]
        job: Option<String>,

        /// Restrict to one platform; `*` wildcards allowed.
        #[arg(long)]
        platform: Option<String>,

        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List every failing test occurrence in a time window.
    Failing {
        #[arg(long, default_value = "now-7d")]
        start_date: String,

        #[arg(long, default_value = "now")]
        end_date: String,

        #[arg(long)]
        collector: Option<String>,

        /// Restrict to one job name; `*` wildcards allowed.
        #[arg(long)]
        job: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// List the builds recorded for a job.
    Job {
        /// Job name; `*` wildcards allowed.
        job_name: String,

        #[arg(long, default_value_t = 10)]
        size: usize,

        #[arg(long, default_value = "now-7d")]
        start_date: String,

        #[arg(long, default_value = "now")]
        end_date: String,

        #[arg(long)]
        json: bool,
    },

    /// Show one build of a job.
    Build {
        /// Job name; `*` wildcards allowed.
        job_name: String,

        /// Build ID.
        build_id: String,
    },

    /// List failed or unstable builds carrying failed tests.
    Failed {
        /// Restrict to one job (exact name).
        #[arg(long)]
        job: Option<String>,

        #[arg(long, default_value_t = 10)]
        size: usize,

        /// Minimum failed-test count for a build to qualify.
        #[arg(long, default_value_t = 5)]
        fail_count: u64,

        /// Lower bound of a failed-test duration band, seconds.
        /// Requires --duration-high.
        #[arg(long)]
        duration_low: Option<f64>,

        /// Upper bound of a failed-test duration band, seconds.
        #[arg(long)]
        duration_high: Option<f64>,

        #[arg(long, default_value = "now-7d")]
        start_date: String,

        #[arg(long, default_value = "now")]
        end_date: String,

        /// Aggregate into per-test failure counts instead of listing builds.
        #[arg(long)]
        counts: bool,

        #[arg(long)]
        json: bool,
    },

    /// Find builds that ran a test matching a fullname pattern.
    Test {
        /// Test fullname pattern; `*` wildcards allowed.
        test_name: String,

        /// Restrict to one job (exact name).
        #[arg(long)]
        job: Option<String>,

        /// Do not search the passed-tests list.
        #[arg(long)]
        exclude_passed: bool,

        /// Do not search the failed-tests list.
        #[arg(long)]
        exclude_failed: bool,

        /// Also search the skipped-tests list.
        #[arg(long)]
        include_skipped: bool,

        #[arg(long, default_value_t = 10)]
        size: usize,

        #[arg(long, default_value = "now-7d")]
        start_date: String,

        #[arg(long, default_value = "now")]
        end_date: String,

        #[arg(long)]
        json: bool,
    },

    /// Assemble XUnit report files into a build document and send it to a
    /// collector (or print it when no collector is configured).
    StoreXunit {
        /// XUnit XML report files.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short = 'j', long)]
        jobname: String,

        /// CI build ID.
        #[arg(short = 'b', long)]
        buildid: String,

        #[arg(short = 'p', long, default_value = "Linux-x86_64")]
        platform: String,

        /// Build timestamp, ISO-8601. Defaults to now (UTC).
        #[arg(long)]
        date: Option<String>,

        /// Build/product grouping key, e.g. "B.1234.COMMIT-1234".
        #[arg(long)]
        buildversion: Option<String>,

        #[arg(short = 'v', long)]
        productversion: Option<String>,

        /// Build status (SUCCESS, FAILURE, UNSTABLE, ...).
        #[arg(long)]
        status: Option<String>,

        #[command(flatten)]
        collector: CollectorArgs,
    },

    /// Fetch a Jenkins build over its JSON API and send it to a collector
    /// (or print it when no collector is configured).
    StoreJenkins {
        /// URL of the Jenkins job, e.g. "https://ci.example.com/job/nightly".
        #[arg(long)]
        buildurl: String,

        /// CI build ID.
        #[arg(short = 'b', long)]
        buildid: String,

        #[arg(short = 'p', long, default_value = "Linux-x86_64")]
        platform: String,

        #[arg(short = 'v', long)]
        productversion: Option<String>,

        #[command(flatten)]
        collector: CollectorArgs,
    },
}

#[derive(clap::Args)]
struct CollectorArgs {
    /// Address of the collector to send to. Omit to print the document.
    #[arg(long)]
    logcollectaddr: Option<String>,

    /// Port on the collector to send to.
    #[arg(long)]
    logcollectport: Option<u16>,

    /// Socket timeout in seconds for the write operation.
    #[arg(long, default_value_t = 10)]
    sockettimeout: u64,

    /// Location of a CA cert to verify against, PEM.
    #[arg(long)]
    cacert: Option<PathBuf>,

    /// Client certificate file. Must also provide a client key.
    #[arg(long)]
    clientcert: Option<PathBuf>,

    /// Client key file. Must also provide a client certificate.
    #[arg(long)]
    clientkey: Option<PathBuf>,
}

impl CollectorArgs {
    fn into_config(self) -> Result<Option<CollectorConfig>> {
        let (host, port) = match (self.logcollectaddr, self.logcollectport) {
            (Some(host), Some(port)) => (host, port),
            (None, None) => return Ok(None),
            _ => bail!("--logcollectaddr and --logcollectport must be set together"),
        };
        Ok(Some(CollectorConfig {
            host,
            port,
            timeout_secs: self.sockettimeout,
            ca_file: self.cacert,
            client_cert: self.clientcert,
            client_key: self.clientkey,
        }))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let store = EsStore::new(&args.store_url, &args.index);

    let output = match args.command {
        Commands::Flaky {
            start_date,
            end_date,
            collector,
            job,
            platform,
            json,
        } => {
            let opts = FlakyQueryOptions {
                start_date,
                end_date,
                collector,
                job_name: job,
                platform,
            };
            cli::cmd_flaky(&store, &opts, json).context("Flaky analysis failed")?
        }
        Commands::Failing {
            start_date,
            end_date,
            collector,
            job,
            json,
        } => cli::cmd_failing(
            &store,
            &start_date,
            &end_date,
            collector.as_deref(),
            job.as_deref(),
            json,
        )?,
        Commands::Job {
            job_name,
            size,
            start_date,
            end_date,
            json,
        } => cli::cmd_job(&store, &job_name, size, &start_date, &end_date, json)?,
        Commands::Build { job_name, build_id } => cli::cmd_build(&store, &job_name, &build_id)?,
        Commands::Failed {
            job,
            size,
            fail_count,
            duration_low,
            duration_high,
            start_date,
            end_date,
            counts,
            json,
        } => {
            let duration = match (duration_low, duration_high) {
                (Some(low), Some(high)) => Some((low, high)),
                (None, None) => None,
                _ => bail!("--duration-low and --duration-high must be set together"),
            };
            let query = FailedTestsQuery {
                job_name: job,
                size,
                fail_count,
                duration,
                start_date,
                end_date,
            };
            cli::cmd_failed(&store, &query, counts, json)?
        }
        Commands::Test {
            test_name,
            job,
            exclude_passed,
            exclude_failed,
            include_skipped,
            size,
            start_date,
            end_date,
            json,
        } => {
            let mask = TestStatusMask {
                passed: !exclude_passed,
                failed: !exclude_failed,
                skipped: include_skipped,
            };
            cli::cmd_test(
                &store,
                &test_name,
                mask,
                job.as_deref(),
                size,
                &start_date,
                &end_date,
                json,
            )?
        }
        Commands::StoreXunit {
            files,
            jobname,
            buildid,
            platform,
            date,
            buildversion,
            productversion,
            status,
            collector,
        } => {
            let meta = BuildMeta {
                job_name: jobname,
                build_id: buildid,
                platform,
                build_date_time: date.unwrap_or_else(|| {
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
                }),
                build_version: buildversion,
                product_version: productversion,
                status,
            };
            let build = cli::assemble_xunit_build(&files, &meta)?;
            cli::deliver_build(&build, collector.into_config()?.as_ref())?
        }
        Commands::StoreJenkins {
            buildurl,
            buildid,
            platform,
            productversion,
            collector,
        } => {
            let client = JenkinsClient::new(&buildurl);
            let build = client
                .fetch_build(&buildid, &platform, productversion.as_deref())
                .context("Failed to fetch Jenkins build")?;
            cli::deliver_build(&build, collector.into_config()?.as_ref())?
        }
    };

    print!("{}", output);
    Ok(())
}
