use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{PersistentVolumeClaim, Pod},
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    NamespaceResourceScope,
};
use kube::{
    api::{
        ApiResource, AttachParams, DeleteParams, DynamicObject, ListParams, LogParams, PostParams,
    },
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersion,
    Api, Client, Config,
};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::{
    api::{ClusterApi, ExecInput, ExecOutput, LogStream},
    error::{KubeApiError, Result},
};

/// [`ClusterApi`] backed by a real cluster.
#[derive(Clone)]
pub struct KubernetesApi {
    client: Client,
    namespace: String,
}

impl KubernetesApi {
    /// Uses `namespace`, or the default namespace of the loaded kube config.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_owned());

        KubernetesApi { client, namespace }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

async fn delete_if_present<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<bool>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            trace!(name, "already deleted");
            Ok(false)
        }
        Err(error) => Err(error.into()),
    }
}

#[async_trait]
impl ClusterApi for KubernetesApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.api::<PersistentVolumeClaim>().get_opt(name).await?)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        Ok(self
            .api::<PersistentVolumeClaim>()
            .create(&PostParams::default(), claim)
            .await?)
    }

    async fn delete_claim(&self, name: &str) -> Result<bool> {
        delete_if_present(
            &self.api::<PersistentVolumeClaim>(),
            name,
            &DeleteParams::foreground(),
        )
        .await
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        Ok(self.api::<Job>().create(&PostParams::default(), job).await?)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.api::<Job>().get_opt(name).await?)
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        delete_if_present(&self.api::<Job>(), name, &DeleteParams::background()).await
    }

    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };

        Ok(self.api::<Pod>().list(&params).await?.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<bool> {
        delete_if_present(&self.api::<Pod>(), name, &DeleteParams::default()).await
    }

    async fn get_owner_meta(&self, owner: &OwnerReference) -> Result<Option<ObjectMeta>> {
        let group_version: GroupVersion = owner
            .api_version
            .parse()
            .map_err(|_| KubeApiError::InvalidOwnerReference(owner.api_version.clone()))?;
        let resource = ApiResource::from_gvk(&group_version.with_kind(&owner.kind));

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);

        Ok(api.get_opt(&owner.name).await?.map(|object| object.metadata))
    }

    async fn log_stream(&self, pod: &str, container: &str) -> Result<LogStream> {
        let logs = self
            .api::<Pod>()
            .log_stream(
                pod,
                &LogParams {
                    follow: true,
                    container: Some(container.to_owned()),
                    ..LogParams::default()
                },
            )
            .await?;

        Ok(Box::pin(logs))
    }

    #[tracing::instrument(level = "debug", skip(self, stdin, stdout, stderr), err)]
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Option<ExecInput>,
        mut stdout: ExecOutput,
        mut stderr: ExecOutput,
    ) -> Result<()> {
        let params = AttachParams::default()
            .container(container)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = self.api::<Pod>().exec(pod, command, &params).await?;

        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let status = attached.take_status();

        let feed_stdin = async {
            if let (Some(mut input), Some(mut remote)) = (stdin, remote_stdin) {
                let sent = tokio::io::copy(&mut input, &mut remote).await?;
                debug!(sent, "stdin exhausted, closing remote stdin");
                remote.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let drain_stdout = async {
            if let Some(mut remote) = remote_stdout {
                tokio::io::copy(&mut remote, &mut stdout).await?;
            }
            stdout.flush().await
        };

        let drain_stderr = async {
            if let Some(mut remote) = remote_stderr {
                tokio::io::copy(&mut remote, &mut stderr).await?;
            }
            stderr.shutdown().await
        };

        tokio::try_join!(feed_stdin, drain_stdout, drain_stderr)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|error| KubeApiError::ExecFailed {
            pod: pod.to_owned(),
            reason: error.to_string(),
        })?;

        match status {
            Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
            Some(status) => Err(KubeApiError::ExecFailed {
                pod: pod.to_owned(),
                reason: status
                    .message
                    .or(status.reason)
                    .unwrap_or_else(|| "unknown failure".to_owned()),
            }),
            None => Err(KubeApiError::ExecFailed {
                pod: pod.to_owned(),
                reason: "stream closed without an exit status".to_owned(),
            }),
        }
    }
}

/// Builds a [`Client`] from an explicit kubeconfig/context, or infers one (local kubeconfig or
/// in-cluster service account).
pub async fn create_kube_api<P>(kubeconfig: Option<P>, kube_context: Option<String>) -> Result<Client>
where
    P: AsRef<str>,
{
    let kube_config_opts = KubeConfigOptions {
        context: kube_context,
        ..Default::default()
    };

    let config = if let Some(kubeconfig) = kubeconfig {
        let parsed_kube_config = Kubeconfig::read_from(kubeconfig.as_ref())?;
        Config::from_custom_kubeconfig(parsed_kube_config, &kube_config_opts).await?
    } else if kube_config_opts.context.is_some() {
        // if context is set, it's not in cluster so it has to be a kubeconfig.
        Config::from_kubeconfig(&kube_config_opts).await?
    } else {
        Config::infer().await?
    };

    Client::try_from(config).map_err(KubeApiError::from)
}
