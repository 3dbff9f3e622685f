//! Workspace-level launcher for the livechat daemon.

fn main() -> anyhow::Result<()> {
    livechatd::cli::run()
}
