use cluster_operator_types::Cluster;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/kubermatic.io_cluster_crd.yaml",
        serde_yaml::to_string(&Cluster::crd()).unwrap(),
    )
    .unwrap();
}
