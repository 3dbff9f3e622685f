//! livechatd - visitor/agent chat hub daemon
//!
//! See `livechatd --help` and [`livechatd::cli`] for usage.

fn main() -> anyhow::Result<()> {
    livechatd::cli::run()
}
