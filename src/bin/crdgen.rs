use kube::CustomResourceExt;
use rgw_standalone_operator::crd::ObjectStore;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&ObjectStore::crd())?);
    Ok(())
}
