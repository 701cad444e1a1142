use arango_deployment::api::v1alpha::ArangoDeployment;
use kube::CustomResourceExt as _;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ArangoDeployment::crd())?);
    Ok(())
}
