use anyhow::{anyhow, Context as _};

fn main() -> anyhow::Result<()> {
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let cargo_metadata::Package {
        name, manifest_path, ..
    } = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| *name == "kernwatch-ebpf")
        .ok_or_else(|| anyhow!("kernwatch-ebpf package not found"))?;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("kernwatch-ebpf manifest has no parent directory"))?;
    aya_build::build_ebpf(
        [aya_build::Package {
            name: name.as_ref(),
            root_dir: root_dir.as_ref(),
            no_default_features: false,
            features: &[],
        }],
        aya_build::Toolchain::default(),
    )
}
