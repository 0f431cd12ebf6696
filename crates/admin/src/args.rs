use clap::{Parser, Subcommand, ValueEnum};

use leaseq_core::{JobId, UniqueTag};

#[derive(Parser, Debug)]
#[command(about = "Operate leaseq job queues", long_about = None, version)]
pub(crate) struct Args {
    /// Queue to operate on. Defaults to `LEASEQ_QUEUE`, then `default`.
    #[arg(short, long, global = true)]
    pub(crate) queue: Option<String>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the jobs table and indexes if missing.
    InitSchema,
    /// Print ready, leased and exhausted counts.
    Stats,
    /// Add a job with a JSON payload.
    Enqueue {
        /// Payload, as JSON.
        data: String,
        #[arg(short, long)]
        tag: Option<String>,
        #[arg(short, long)]
        priority: Option<i32>,
        /// What to do when the tag is already queued.
        #[arg(short, long, value_enum)]
        unique_tag: Option<TagPolicy>,
    },
    /// List jobs that used up their tries.
    Exhausted {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Give an exhausted job a fresh set of tries.
    Revive { id: JobId },
    /// Delete a job by id, leased or not.
    Cancel { id: JobId },
    /// Delete the job carrying a tag.
    CancelTag { tag: String },
    /// Consume and acknowledge jobs, logging each one, until Ctrl-C.
    Drain {
        #[arg(short, long, default_value_t = 10)]
        batch: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TagPolicy {
    KeepOld,
    TakeNew,
}

impl From<TagPolicy> for UniqueTag {
    fn from(value: TagPolicy) -> Self {
        match value {
            TagPolicy::KeepOld => UniqueTag::KeepOld,
            TagPolicy::TakeNew => UniqueTag::TakeNew,
        }
    }
}
