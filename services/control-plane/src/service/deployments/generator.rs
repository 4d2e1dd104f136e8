//! Desired subsystem objects of a deployment.
//!
//! Pure functions of the deployment record and the fabric description.

use std::collections::BTreeMap;

use fabric_id::UserId;
use serde_json::json;

use crate::config::{FabricConfig, ZoneConfig};
use crate::model::deployment::Deployment;
use crate::service::k8s::{K8sObjects, WILDCARD_CERT_SECRET};
use crate::service::owner_scope;
use crate::subsystems::github::{BuildRun, Webhook as GithubWebhook};
use crate::subsystems::harbor::{Project, Repository, Robot, Webhook as HarborWebhook};
use crate::subsystems::k8s::{
    Deployment as K8sDeployment, EnvVar, Ingress, Namespace, PersistentVolume,
    PersistentVolumeClaim, Secret, SecretType, Service, VolumeMount,
};

/// Logical name of the single app object in each k8s map.
pub const MAIN: &str = "main";
pub const CUSTOM_DOMAIN: &str = "customDomain";
pub const WILDCARD_CERT: &str = "wildcardCert";
pub const IMAGE_PULL_SECRET: &str = "imagePullSecret";

const VOLUME_CAPACITY: &str = "10Gi";
const HARBOR_WEBHOOK_NAME: &str = "fabric";

/// Registry host without scheme, as used in image references.
pub fn registry_host(config: &FabricConfig) -> &str {
    let url = config.registry.url.trim_end_matches('/');
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Image a custom deployment runs: the repository in its owner's project.
pub fn custom_image(config: &FabricConfig, owner: &UserId, name: &str) -> String {
    format!("{}/{}/{}", registry_host(config), owner_scope(owner), name)
}

fn pvc_name(deployment: &Deployment, volume: &str) -> String {
    format!("{}-{}", deployment.name, volume)
}

fn pv_name(deployment: &Deployment, volume: &str) -> String {
    format!("pv-{}-{}", deployment.name, volume)
}

fn image_pull_secret_name(deployment: &Deployment) -> String {
    format!("{}-image-pull-secret", deployment.name)
}

/// Every k8s object the deployment needs.
pub fn k8s(deployment: &Deployment, zone: &ZoneConfig, config: &FabricConfig) -> K8sObjects {
    let ns = owner_scope(&deployment.owner_id);
    let mut objects = K8sObjects {
        namespace: Namespace {
            name: ns.clone(),
            created_at: None,
        },
        ..K8sObjects::default()
    };

    let mut envs: Vec<EnvVar> = deployment
        .envs
        .iter()
        .filter(|e| e.name != "PORT")
        .map(|e| EnvVar {
            name: e.name.clone(),
            value: e.value.clone(),
        })
        .collect();
    envs.push(EnvVar {
        name: "PORT".to_string(),
        value: deployment.internal_port.to_string(),
    });

    let mut image_pull_secrets = Vec::new();
    if deployment.is_custom() {
        if let Some(robot) = &deployment.subsystems.harbor.robot {
            let secret = image_pull_secret(deployment, &ns, robot, config);
            image_pull_secrets.push(secret.name.clone());
            objects.secrets.insert(IMAGE_PULL_SECRET.to_string(), secret);
        }
    }

    for volume in &deployment.volumes {
        let pv = PersistentVolume {
            name: pv_name(deployment, &volume.name),
            capacity: VOLUME_CAPACITY.to_string(),
            nfs_server: zone.nfs_server.clone(),
            nfs_path: format!(
                "{}/{}/user/{}",
                zone.nfs_path.trim_end_matches('/'),
                deployment.owner_id,
                volume.server_path.trim_start_matches('/')
            ),
            created_at: None,
        };
        let pvc = PersistentVolumeClaim {
            name: pvc_name(deployment, &volume.name),
            namespace: ns.clone(),
            capacity: VOLUME_CAPACITY.to_string(),
            volume_name: pv.name.clone(),
            created_at: None,
        };
        objects.pvs.insert(volume.name.clone(), pv);
        objects.pvcs.insert(volume.name.clone(), pvc);
    }

    let volumes = deployment
        .volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            pvc_name: pvc_name(deployment, &v.name),
            mount_path: v.app_path.clone(),
        })
        .collect();

    objects.deployments.insert(
        MAIN.to_string(),
        K8sDeployment {
            name: deployment.name.clone(),
            namespace: ns.clone(),
            image: deployment.image.clone(),
            replicas: deployment.replicas,
            envs,
            port: Some(deployment.internal_port),
            volumes,
            image_pull_secrets,
            args: deployment.args.clone(),
            restarted_at: deployment.restarted_at,
            created_at: None,
        },
    );

    objects.services.insert(
        MAIN.to_string(),
        Service {
            name: deployment.name.clone(),
            namespace: ns.clone(),
            port: deployment.internal_port,
            target_port: deployment.internal_port,
            selector: deployment.name.clone(),
            created_at: None,
        },
    );

    if deployment.private {
        return objects;
    }

    objects.secrets.insert(
        WILDCARD_CERT.to_string(),
        Secret {
            name: WILDCARD_CERT_SECRET.to_string(),
            namespace: ns.clone(),
            secret_type: SecretType::Tls,
            data: BTreeMap::new(),
            created_at: None,
        },
    );

    objects.ingresses.insert(
        MAIN.to_string(),
        Ingress {
            name: deployment.name.clone(),
            namespace: ns.clone(),
            service_name: deployment.name.clone(),
            service_port: deployment.internal_port,
            hosts: vec![format!("{}.{}", deployment.name, zone.deployment_domain)],
            tls_secret: Some(WILDCARD_CERT_SECRET.to_string()),
            created_at: None,
        },
    );

    if let Some(domain) = &deployment.custom_domain {
        objects.ingresses.insert(
            CUSTOM_DOMAIN.to_string(),
            Ingress {
                name: format!("{}-custom-domain", deployment.name),
                namespace: ns,
                service_name: deployment.name.clone(),
                service_port: deployment.internal_port,
                hosts: vec![domain.clone()],
                tls_secret: None,
                created_at: None,
            },
        );
    }

    objects
}

fn image_pull_secret(deployment: &Deployment, ns: &str, robot: &Robot, config: &FabricConfig) -> Secret {
    let auths = json!({
        "auths": {
            registry_host(config): {
                "username": robot.full_name(),
                "password": robot.secret.clone().unwrap_or_default(),
            }
        }
    });
    Secret {
        name: image_pull_secret_name(deployment),
        namespace: ns.to_string(),
        secret_type: SecretType::ImagePull,
        data: BTreeMap::from([(".dockerconfigjson".to_string(), auths.to_string())]),
        created_at: None,
    }
}

/// Registry objects of a custom deployment.
#[derive(Debug, Clone)]
pub struct HarborObjects {
    pub project: Project,
    pub robot: Robot,
    pub repository: Repository,
    pub webhook: HarborWebhook,
}

pub fn harbor(deployment: &Deployment, config: &FabricConfig) -> HarborObjects {
    let project = owner_scope(&deployment.owner_id);
    HarborObjects {
        project: Project {
            name: project.clone(),
            public: false,
            ..Project::default()
        },
        robot: Robot {
            name: deployment.name.clone(),
            project: project.clone(),
            description: format!("Pull credentials for deployment {}", deployment.name),
            ..Robot::default()
        },
        repository: Repository {
            name: deployment.name.clone(),
            project: project.clone(),
            ..Repository::default()
        },
        webhook: HarborWebhook {
            name: HARBOR_WEBHOOK_NAME.to_string(),
            project,
            target: format!("{}/v2/hooks/harbor", config.external_url.trim_end_matches('/')),
            token: config.registry.webhook_secret.clone(),
            ..HarborWebhook::default()
        },
    }
}

/// Push webhook on the source repository, if the deployment builds from one.
pub fn github_webhook(deployment: &Deployment, config: &FabricConfig) -> Option<GithubWebhook> {
    let source = deployment.github.as_ref()?;
    Some(GithubWebhook {
        name: format!("fabric-{}", deployment.name),
        repository_id: source.repository_id,
        target: format!("{}/v2/hooks/github", config.external_url.trim_end_matches('/')),
        secret: config.github.webhook_secret.clone(),
        events: vec!["push".to_string()],
        ..GithubWebhook::default()
    })
}

/// A build of `git_ref` pushing to the deployment's image.
pub fn build_run(deployment: &Deployment, git_ref: &str) -> Option<BuildRun> {
    let source = deployment.github.as_ref()?;
    let suffix = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    Some(BuildRun {
        name: format!("{}-{suffix}", deployment.name),
        repository_id: source.repository_id,
        git_ref: git_ref.to_string(),
        image: deployment.image.clone(),
        ..BuildRun::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::deployment::{DeploymentType, Env, GithubSource, Volume};
    use crate::service::testing;

    fn deployment(name: &str) -> Deployment {
        testing::deployment("alice", name)
    }

    fn zone(config: &FabricConfig) -> &ZoneConfig {
        config.default_zone()
    }

    #[test]
    fn test_public_deployment() {
        let config = FabricConfig::default();
        let mut d = deployment("web");
        d.envs = vec![
            Env {
                name: "MODE".into(),
                value: "prod".into(),
            },
            Env {
                name: "PORT".into(),
                value: "1".into(),
            },
        ];
        let objects = k8s(&d, zone(&config), &config);

        assert_eq!(objects.namespace.name, "u-alice");
        let main = &objects.deployments[MAIN];
        assert_eq!(main.namespace, "u-alice");
        assert_eq!(
            main.envs.iter().map(|e| (e.name.as_str(), e.value.as_str())).collect::<Vec<_>>(),
            vec![("MODE", "prod"), ("PORT", "8080")]
        );
        assert_eq!(objects.services[MAIN].selector, "web");
        assert_eq!(objects.ingresses[MAIN].hosts, vec!["web.app.fabric.local"]);
        assert_eq!(
            objects.ingresses[MAIN].tls_secret.as_deref(),
            Some(WILDCARD_CERT_SECRET)
        );
        assert_eq!(objects.secrets[WILDCARD_CERT].name, WILDCARD_CERT_SECRET);
        assert!(!objects.secrets.contains_key(IMAGE_PULL_SECRET));
    }

    #[test]
    fn test_private_deployment_has_no_ingress() {
        let config = FabricConfig::default();
        let mut d = deployment("web");
        d.private = true;
        d.custom_domain = Some("example.org".into());
        let objects = k8s(&d, zone(&config), &config);
        assert!(objects.ingresses.is_empty());
        assert!(objects.secrets.is_empty());
    }

    #[test]
    fn test_custom_domain_ingress() {
        let config = FabricConfig::default();
        let mut d = deployment("web");
        d.custom_domain = Some("example.org".into());
        let objects = k8s(&d, zone(&config), &config);
        let custom = &objects.ingresses[CUSTOM_DOMAIN];
        assert_eq!(custom.name, "web-custom-domain");
        assert_eq!(custom.hosts, vec!["example.org"]);
        assert!(custom.tls_secret.is_none());
    }

    #[test]
    fn test_volumes_are_nfs_backed() {
        let config = FabricConfig::default();
        let mut d = deployment("web");
        d.volumes = vec![Volume {
            name: "data".into(),
            app_path: "/var/data".into(),
            server_path: "/web/data".into(),
        }];
        let objects = k8s(&d, zone(&config), &config);

        let pv = &objects.pvs["data"];
        assert_eq!(pv.name, "pv-web-data");
        assert_eq!(pv.nfs_server, "nfs.fabric.local");
        assert_eq!(pv.nfs_path, "/mnt/cloud/alice/user/web/data");
        let pvc = &objects.pvcs["data"];
        assert_eq!(pvc.volume_name, "pv-web-data");
        assert_eq!(objects.deployments[MAIN].volumes[0].pvc_name, "web-data");
    }

    #[test]
    fn test_custom_deployment_pulls_with_robot() {
        let config = FabricConfig::default();
        let mut d = deployment("api");
        d.deployment_type = DeploymentType::Custom;
        d.image = custom_image(&config, &d.owner_id, &d.name);
        d.subsystems.harbor.robot = Some(Robot {
            name: "api".into(),
            project: "u-alice".into(),
            secret: Some("s3cret".into()),
            ..Robot::default()
        });
        let objects = k8s(&d, zone(&config), &config);

        assert_eq!(d.image, "registry.fabric.local/u-alice/api");
        let secret = &objects.secrets[IMAGE_PULL_SECRET];
        assert_eq!(secret.secret_type, SecretType::ImagePull);
        let auths: serde_json::Value =
            serde_json::from_str(&secret.data[".dockerconfigjson"]).unwrap();
        assert_eq!(
            auths["auths"]["registry.fabric.local"]["username"],
            "robot$u-alice+api"
        );
        assert_eq!(
            objects.deployments[MAIN].image_pull_secrets,
            vec!["api-image-pull-secret"]
        );
    }

    #[test]
    fn test_harbor_objects_live_in_owner_project() {
        let config = FabricConfig::default();
        let objects = harbor(&deployment("api"), &config);
        assert_eq!(objects.project.name, "u-alice");
        assert_eq!(objects.robot.project, "u-alice");
        assert_eq!(objects.repository.name, "api");
        assert_eq!(objects.webhook.target, "http://127.0.0.1:8080/v2/hooks/harbor");
    }

    #[test]
    fn test_github_objects_need_a_source() {
        let config = FabricConfig::default();
        let mut d = deployment("api");
        assert!(github_webhook(&d, &config).is_none());
        assert!(build_run(&d, "main").is_none());

        d.github = Some(GithubSource {
            repository_id: 42,
            repository_name: "alice/api".into(),
            default_branch: Some("main".into()),
        });
        let hook = github_webhook(&d, &config).unwrap();
        assert_eq!(hook.repository_id, 42);
        assert_eq!(hook.events, vec!["push"]);
        assert_eq!(build_run(&d, "main").unwrap().git_ref, "main");
    }

    #[test]
    fn test_registry_host_strips_scheme() {
        let mut config = FabricConfig::default();
        config.registry.url = "https://registry.example.org/".into();
        assert_eq!(registry_host(&config), "registry.example.org");
    }
}
