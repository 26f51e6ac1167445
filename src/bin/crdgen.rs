use kube::CustomResourceExt;

use kubeblocks_operator::resources::{
    Cluster, Component, ComponentDefinition, ComponentParameter, InstanceSet, OpsRequest,
    ParamConfigRenderer, ParametersDefinition,
};

fn main() {
    let resources = [
        Cluster::crd(),
        Component::crd(),
        ComponentDefinition::crd(),
        InstanceSet::crd(),
        ParametersDefinition::crd(),
        ParamConfigRenderer::crd(),
        ComponentParameter::crd(),
        OpsRequest::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource).unwrap());
    }
}
