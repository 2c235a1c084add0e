use anyhow::Result;

use crate::Context;
use crate::cli::Component;
use crate::config::NodeConfig;
use crate::flags::render_flags;

pub fn run(ctx: &Context, component: Component) -> Result<()> {
    let config = NodeConfig::load(&ctx.config_path)?;
    let rendered = match component {
        Component::KubeApiserver => render_flags(&config.kube_apiserver.unwrap_or_default())?,
        Component::Kubelet => render_flags(&config.kubelet.unwrap_or_default())?,
    };
    println!("{rendered}");
    Ok(())
}
