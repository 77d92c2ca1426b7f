use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use factory_core::api::{TriggerRequest, TriggerResponse};
use factory_core::model::{
    ActivityStatus, EngagementMetrics, LengthCategory, Platform, RunStatus, StageName, TaskKind,
    TaskStatus, TopicCategory,
};
use factory_core::policy::{PolicyState, POSSIBLE_TOPICS};
use factory_core::{now_ms, topic_slug};
use factory_daemon::activity::{ActivityLog, PerformanceLog};
use factory_daemon::config::FactoryConfig;
use factory_daemon::context::FactoryContext;
use factory_daemon::gate::{LoadProbe, LoadSample, ResourceGate};
use factory_daemon::notify::{Notification, Notifier};
use factory_daemon::policy::PolicyHandle;
use factory_daemon::publish::{PrimaryPost, Publisher, SecondaryPost};
use factory_daemon::scheduler;
use factory_daemon::service::{Admission, FactoryService};
use factory_daemon::stages::{AssembledVideo, Stages};
use factory_daemon::store::{MemoryStore, TaskStore};
use factory_daemon::trends::StaticTrends;
use tempfile::TempDir;

struct FixedProbe(LoadSample);

impl LoadProbe for FixedProbe {
    fn sample(&self) -> Result<LoadSample> {
        Ok(self.0)
    }
}

/// Writes placeholder artifacts named after the topic slug.
struct FakeStages {
    data_dir: PathBuf,
    fail_at: Option<StageName>,
}

impl FakeStages {
    async fn write(&self, dir: &str, name: String) -> Result<PathBuf> {
        let path = self.data_dir.join(dir).join(name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, b"artifact").await?;
        Ok(path)
    }

    fn check(&self, stage: StageName) -> Result<()> {
        if self.fail_at == Some(stage) {
            anyhow::bail!("{stage} collaborator offline");
        }
        Ok(())
    }
}

#[async_trait]
impl Stages for FakeStages {
    async fn script(&self, topic: &str, _duration_sec: u32) -> Result<PathBuf> {
        self.check(StageName::Script)?;
        self.write("scripts", format!("{}.txt", topic_slug(topic))).await
    }

    async fn voice(&self, topic: &str, _script: &Path) -> Result<PathBuf> {
        self.check(StageName::Voice)?;
        self.write("audio", format!("{}.wav", topic_slug(topic))).await
    }

    async fn visuals(&self, topic: &str) -> Result<Vec<PathBuf>> {
        self.check(StageName::Visuals)?;
        let slug = topic_slug(topic);
        Ok(vec![
            self.write("images", format!("{slug}_0.png")).await?,
            self.write("images", format!("{slug}_1.png")).await?,
        ])
    }

    async fn subtitles(&self, topic: &str, _audio: &Path) -> Result<Vec<PathBuf>> {
        self.check(StageName::Subtitles)?;
        let slug = topic_slug(topic);
        Ok(vec![
            self.write("subtitles", format!("{slug}_fa.srt")).await?,
            self.write("subtitles", format!("{slug}_en.srt")).await?,
        ])
    }

    async fn assemble(
        &self,
        topic: &str,
        _visuals: &[PathBuf],
        _audio: &Path,
        burn_in: Option<&Path>,
    ) -> Result<AssembledVideo> {
        self.check(StageName::Assembly)?;
        assert!(burn_in.is_some_and(|p| p.to_string_lossy().ends_with("_fa.srt")));
        let path = self.write("videos", format!("{}.mp4", topic_slug(topic))).await?;
        Ok(AssembledVideo {
            path,
            duration_sec: 181.0,
        })
    }
}

#[derive(Default)]
struct FakePublisher {
    calls: Mutex<Vec<(Platform, String)>>,
    primary_delay: Duration,
    fail_secondary: Option<Platform>,
}

impl FakePublisher {
    fn calls(&self) -> Vec<(Platform, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish_primary(&self, post: &PrimaryPost) -> Result<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((Platform::YouTube, post.title.clone()));
        tokio::time::sleep(self.primary_delay).await;
        Ok(Some("abc123".to_string()))
    }

    async fn publish_secondary(&self, platform: Platform, post: &SecondaryPost) -> Result<Option<String>> {
        self.calls.lock().unwrap().push((platform, post.text.clone()));
        if self.fail_secondary == Some(platform) {
            anyhow::bail!("{platform} rejected the post");
        }
        Ok(Some(format!("{platform}-post")))
    }

    async fn fetch_engagement(&self, _platform: Platform, _content_id: &str) -> Result<EngagementMetrics> {
        Ok(EngagementMetrics {
            views: 1_000,
            likes: 40,
            comments: 10,
            ctr: 0.05,
            avg_watch_time_sec: 100.0,
            sentiment: 0.5,
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, note: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(note.clone());
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    ctx: Arc<FactoryContext>,
    svc: FactoryService,
    publisher: Arc<FakePublisher>,
    notes: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(cpu_percent: f32, fail_at: Option<StageName>) -> Self {
        Self::build(cpu_percent, fail_at, FakePublisher::default(), |_| {})
    }

    fn build(
        cpu_percent: f32,
        fail_at: Option<StageName>,
        publisher: FakePublisher,
        configure: impl FnOnce(&mut FactoryConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();

        let mut config = FactoryConfig::default();
        config.policy.agent.epsilon = 0.0;
        config.policy.agent.trending_override_probability = 0.0;
        configure(&mut config);

        let policy =
            PolicyHandle::load(config.policy.agent.clone(), data_dir.join("policy_model.json")).unwrap();
        let publisher = Arc::new(publisher);
        let notes = Arc::new(RecordingNotifier::default());
        let probe = FixedProbe(LoadSample {
            cpu_percent,
            ram_percent: 40.0,
        });

        let ctx = Arc::new(FactoryContext {
            gate: ResourceGate::new(Arc::new(probe), &config.gate),
            store: Arc::new(MemoryStore::new()),
            policy: Arc::new(policy),
            activity: Arc::new(ActivityLog::new(data_dir.join("activity.log"))),
            performance: Arc::new(PerformanceLog::new(data_dir.join("performance.json"))),
            stages: Arc::new(FakeStages {
                data_dir: data_dir.clone(),
                fail_at,
            }),
            publisher: publisher.clone(),
            trends: Arc::new(StaticTrends(vec![])),
            notifier: notes.clone(),
            data_dir,
            config,
        });
        let svc = FactoryService::new(Arc::clone(&ctx));
        Self {
            dir,
            ctx,
            svc,
            publisher,
            notes,
        }
    }

    /// Notifications are sent from background tasks; give them a moment.
    async fn notifications(&self) -> Vec<Notification> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.notes.sent.lock().unwrap().clone()
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Runs every task due at `at` until the queue is drained.
    async fn drain_at(&self, at: i64) -> usize {
        let mut n = 0;
        while let Some(task) = self.ctx.store.claim_due("test", at, 60_000).unwrap() {
            scheduler::run_task(&self.ctx, task).await.unwrap();
            n += 1;
        }
        n
    }
}

fn good_metrics() -> EngagementMetrics {
    EngagementMetrics {
        views: 500,
        likes: 20,
        comments: 5,
        ctr: 0.05,
        avg_watch_time_sec: 100.0,
        sentiment: 0.5,
    }
}

#[tokio::test]
async fn idle_gate_produces_publishes_primary_and_defers_secondaries() {
    let h = Harness::new(10.0, None);
    // Prior feedback makes the VPN topic the greedy pick for (General, Short).
    h.ctx
        .policy
        .learn(PolicyState::default(), "MikroTik VPN Setup", &good_metrics())
        .await
        .unwrap();

    let run = match h.svc.run_now(TriggerRequest::default()).await.unwrap() {
        Admission::Started(run) => run,
        other => panic!("expected a run, got {other:?}"),
    };
    assert_eq!(run.topic, "MikroTik VPN Setup");
    assert_eq!(run.length_category, LengthCategory::Short);
    assert_eq!(run.estimated_duration_sec, 180);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.stage_outputs.len(), 5);
    assert_eq!(run.duration_sec, Some(181.0));
    assert_eq!(
        h.ctx.store.get_run(&run.run_id).unwrap().unwrap().status,
        RunStatus::Succeeded
    );

    let tasks = h.ctx.store.tasks_for_run(&run.run_id).unwrap();
    let primary = tasks
        .iter()
        .find(|t| matches!(t.kind, TaskKind::PublishPrimary { .. }))
        .unwrap();
    assert_eq!(primary.status, TaskStatus::Succeeded);
    assert_eq!(primary.result.as_deref(), Some("abc123"));

    let deferred: Vec<_> = tasks.iter().filter(|t| t.status == TaskStatus::Pending).collect();
    assert_eq!(deferred.len(), 3);
    assert!(deferred.iter().all(|t| t.eta_ms > now_ms()));

    let activity = h.ctx.activity.tail(100).await.unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].platform, "youtube");
    assert_eq!(activity[0].status, ActivityStatus::Success);
    assert_eq!(h.publisher.calls().len(), 1);

    // Nothing else is due yet.
    assert_eq!(h.drain_at(now_ms()).await, 0);

    // Two days later every deferred step has run.
    let later = now_ms() + 2 * 24 * 3_600_000;
    assert_eq!(h.drain_at(later).await, 4);
    let tasks = h.ctx.store.tasks_for_run(&run.run_id).unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Succeeded), "{tasks:#?}");

    let calls = h.publisher.calls();
    let twitter = calls.iter().find(|(p, _)| *p == Platform::Twitter).unwrap();
    assert!(twitter.1.contains("abc123"));
    assert!(calls.iter().any(|(p, _)| *p == Platform::Instagram));

    let records = h.ctx.performance.all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].media_id, "instagram-post");
    assert_eq!(records[0].category, TopicCategory::Vpn);
    assert_eq!(records[0].engagement_rate, 5.0);
    assert!((records[0].reward.unwrap() - 25.0).abs() < 1e-9);

    assert!(h.path("backup/MikroTik_VPN_Setup/MikroTik_VPN_Setup.mp4").exists());
    assert!(!h.path("scripts/MikroTik_VPN_Setup.txt").exists());
    assert!(!h.path("images/MikroTik_VPN_Setup_0.png").exists());
    assert_eq!(h.svc.backups().await.unwrap().len(), 1);

    let platforms: Vec<String> = h
        .ctx
        .activity
        .tail(100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.platform)
        .collect();
    assert!(platforms.contains(&"instagram:analytics".to_string()));
}

#[tokio::test]
async fn busy_gate_starts_nothing() {
    let h = Harness::new(95.0, None);
    match h.svc.trigger(TriggerRequest::default()).await.unwrap() {
        TriggerResponse::Postponed { reason } => assert!(reason.starts_with("system busy")),
        other => panic!("expected postponement, got {other:?}"),
    }
    assert!(h.ctx.store.recent_runs(10).unwrap().is_empty());
    assert!(h.ctx.store.open_tasks().unwrap().is_empty());
    assert!(h.ctx.activity.tail(10).await.unwrap().is_empty());
    assert!(!h.path("activity.log").exists());
    assert!(!h.path("policy_model.json").exists());
    assert!(h.notifications().await.is_empty());
}

#[tokio::test]
async fn voice_failure_fails_the_run_and_notifies_once() {
    let h = Harness::new(10.0, Some(StageName::Voice));
    let req = TriggerRequest {
        topic: Some("MikroTik QoS".into()),
        length_category: Some(LengthCategory::Long),
    };
    let run = match h.svc.run_now(req).await.unwrap() {
        Admission::Started(run) => run,
        other => panic!("expected a run, got {other:?}"),
    };

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("voice"));
    assert_eq!(run.estimated_duration_sec, 600);
    assert!(h.path("scripts/MikroTik_QoS.txt").exists());
    assert!(h.ctx.store.tasks_for_run(&run.run_id).unwrap().is_empty());
    assert!(h.publisher.calls().is_empty());

    let sent = h.notifications().await;
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Notification::StageFailure { stage, topic, .. } => {
            assert_eq!(*stage, StageName::Voice);
            assert_eq!(topic, "MikroTik QoS");
        }
        other => panic!("unexpected notification {other:?}"),
    }
    assert!(sent[0].subject().contains("voice"));

    // The service keeps serving after a failed run.
    let status = h.svc.status().unwrap();
    assert!(status.active_runs.is_empty());
    assert_eq!(status.recent_runs.len(), 1);
}

#[tokio::test]
async fn manual_off_policy_topic_skips_learning() {
    let h = Harness::new(10.0, None);
    let req = TriggerRequest {
        topic: Some("MikroTik Hotspot".into()),
        length_category: None,
    };
    let Admission::Started(run) = h.svc.run_now(req).await.unwrap() else {
        panic!("expected a run");
    };
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(!POSSIBLE_TOPICS.contains(&run.topic.as_str()));

    h.drain_at(now_ms() + 2 * 24 * 3_600_000).await;
    let records = h.ctx.performance.all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reward, None);
    assert!(!h.path("policy_model.json").exists());
}

#[tokio::test]
async fn cancelled_secondary_skips_its_dependents() {
    let h = Harness::new(10.0, None);
    let Admission::Started(run) = h
        .svc
        .run_now(TriggerRequest {
            topic: Some("MikroTik VLANs".into()),
            length_category: None,
        })
        .await
        .unwrap()
    else {
        panic!("expected a run");
    };
    let insta = h
        .ctx
        .store
        .tasks_for_run(&run.run_id)
        .unwrap()
        .into_iter()
        .find(|t| matches!(t.kind, TaskKind::PublishSecondary { platform: Platform::Instagram, .. }))
        .unwrap();
    assert!(h.svc.cancel(&insta.task_id).unwrap());

    h.drain_at(now_ms() + 2 * 24 * 3_600_000).await;
    let tasks = h.ctx.store.tasks_for_run(&run.run_id).unwrap();
    let storage = tasks
        .iter()
        .find(|t| matches!(t.kind, TaskKind::ManageStorage { .. }))
        .unwrap();
    assert_eq!(storage.status, TaskStatus::Skipped);
    assert!(h.path("videos/MikroTik_VLANs.mp4").exists());
    assert!(h.ctx.performance.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_primary_upload_keeps_its_lease() {
    let publisher = FakePublisher {
        primary_delay: Duration::from_millis(1_500),
        ..FakePublisher::default()
    };
    let h = Harness::build(10.0, None, publisher, |c| c.schedule.lease_ms = 1_000);

    // A dispatcher tick lands while the upload is still in flight.
    let ctx = Arc::clone(&h.ctx);
    let dispatcher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        scheduler::tick(&ctx, "worker-0").await.unwrap()
    });

    let Admission::Started(run) = h
        .svc
        .run_now(TriggerRequest {
            topic: Some("MikroTik Firewall".into()),
            length_category: None,
        })
        .await
        .unwrap()
    else {
        panic!("expected a run");
    };
    assert_eq!(dispatcher.await.unwrap(), 0);

    let uploads = h
        .publisher
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == Platform::YouTube)
        .count();
    assert_eq!(uploads, 1);
    assert_eq!(run.status, RunStatus::Succeeded);
    let primary = h
        .ctx
        .store
        .tasks_for_run(&run.run_id)
        .unwrap()
        .into_iter()
        .find(|t| matches!(t.kind, TaskKind::PublishPrimary { .. }))
        .unwrap();
    assert_eq!(primary.status, TaskStatus::Succeeded);
    assert_eq!(primary.attempts, 1);
}

#[tokio::test]
async fn failed_secondary_leaves_the_others_and_the_run_alone() {
    let publisher = FakePublisher {
        fail_secondary: Some(Platform::Twitter),
        ..FakePublisher::default()
    };
    let h = Harness::build(10.0, None, publisher, |_| {});
    let Admission::Started(run) = h
        .svc
        .run_now(TriggerRequest {
            topic: Some("MikroTik QoS".into()),
            length_category: None,
        })
        .await
        .unwrap()
    else {
        panic!("expected a run");
    };

    h.drain_at(now_ms() + 2 * 24 * 3_600_000).await;
    let tasks = h.ctx.store.tasks_for_run(&run.run_id).unwrap();
    let status_of = |want: Platform| {
        tasks
            .iter()
            .find(|t| matches!(t.kind, TaskKind::PublishSecondary { platform, .. } if platform == want))
            .map(|t| t.status)
            .unwrap()
    };
    assert_eq!(status_of(Platform::Twitter), TaskStatus::Failed);
    assert_eq!(status_of(Platform::Instagram), TaskStatus::Succeeded);
    let primary = tasks
        .iter()
        .find(|t| matches!(t.kind, TaskKind::PublishPrimary { .. }))
        .unwrap();
    assert_eq!(primary.status, TaskStatus::Succeeded);
    assert_eq!(
        h.ctx.store.get_run(&run.run_id).unwrap().unwrap().status,
        RunStatus::Succeeded
    );

    let activity = h.ctx.activity.tail(100).await.unwrap();
    let twitter_failures = activity
        .iter()
        .filter(|e| e.platform == "twitter" && e.status == ActivityStatus::Failure)
        .count();
    assert_eq!(twitter_failures, 1);
    assert!(activity
        .iter()
        .any(|e| e.platform == "instagram" && e.status == ActivityStatus::Success));

    let sent = h.notifications().await;
    assert!(sent.iter().any(|n| matches!(
        n,
        Notification::PublishFailed { platform: Platform::Twitter, .. }
    )));
}
