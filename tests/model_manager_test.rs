//! 模型生命周期集成测试：并发 run 下的单飞加载、互不阻塞与预算淘汰

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::FutureExt;
    use tokio_util::sync::CancellationToken;
    use tool_agent::llm::{
        ManagerConfig, MockBackendFactory, ModelLifecycleManager, ModelState, ScriptItem,
    };
    use tool_agent::react::{AgentLoop, LoopConfig, RunRequest, RunStatus};
    use tool_agent::tools::{CalculatorTool, ToolRegistry};

    fn agent_with(factory: Arc<MockBackendFactory>, budget: u64) -> (Arc<AgentLoop>, Arc<ModelLifecycleManager>) {
        let manager = Arc::new(ModelLifecycleManager::new(
            factory,
            ManagerConfig {
                memory_budget_bytes: budget,
            },
        ));
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool).unwrap();
        let agent = Arc::new(AgentLoop::new(
            Arc::new(registry),
            manager.clone(),
            LoopConfig::default(),
        ));
        (agent, manager)
    }

    #[tokio::test]
    async fn test_concurrent_resolves_for_unseen_model_load_once() {
        let factory = Arc::new(
            MockBackendFactory::new().with_load_delay(Duration::from_millis(50)),
        );
        let manager = ModelLifecycleManager::new(
            factory.clone(),
            ManagerConfig {
                memory_budget_bytes: 10,
            },
        );
        let (a, b) = tokio::join!(manager.resolve("llama"), manager.resolve("llama"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(a.backend(), b.backend()));
        assert_eq!(factory.load_count(), 1);
        assert_eq!(manager.list_models()[0].in_use, 2);
        drop(a);
        drop(b);
        assert_eq!(manager.list_models()[0].in_use, 0);
    }

    #[tokio::test]
    async fn test_other_model_cannot_evict_load_before_waiters_wake() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_default_footprint(60)
                .with_load_delay(Duration::from_millis(20)),
        );
        let manager = ModelLifecycleManager::new(
            factory.clone(),
            ManagerConfig {
                memory_budget_bytes: 100,
            },
        );

        let mut first = Box::pin(manager.resolve("a"));
        let mut second = Box::pin(manager.resolve("a"));
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());
        while manager.state_of("a") != Some(ModelState::Ready) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(manager.resolve("b").await.is_err());
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(Arc::ptr_eq(first.backend(), second.backend()));
        assert_eq!(factory.load_count(), 1);
        assert_eq!(manager.list_models()[0].in_use, 2);
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_one_load() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_script(["Final Answer: ok"])
                .with_load_delay(Duration::from_millis(50)),
        );
        let (agent, manager) = agent_with(factory.clone(), 10);

        let runs: Vec<_> = (0..4)
            .map(|i| {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    agent
                        .run(
                            RunRequest::new(format!("question {i}"), "shared"),
                            CancellationToken::new(),
                            None,
                        )
                        .await
                })
            })
            .collect();
        for handle in runs {
            let run = handle.await.unwrap();
            assert_eq!(run.status, RunStatus::Succeeded);
            assert_eq!(run.final_answer, "ok");
        }

        assert_eq!(factory.load_count(), 1);
        assert_eq!(manager.state_of("shared"), Some(ModelState::Ready));
    }

    #[tokio::test]
    async fn test_stalled_model_does_not_block_other_models() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_model_script("stalled", [ScriptItem::Hang])
                .with_model_script("healthy", ["Final Answer: fine"]),
        );
        let (agent, manager) = agent_with(factory.clone(), 10);

        let cancel = CancellationToken::new();
        let stalled = {
            let agent = Arc::clone(&agent);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                agent
                    .run(RunRequest::new("q", "stalled"), cancel, None)
                    .await
            })
        };

        // 等 stalled 的 run 进入生成阶段
        while manager
            .list_models()
            .iter()
            .all(|m| m.model_id != "stalled" || m.in_use == 0)
        {
            tokio::task::yield_now().await;
        }

        let healthy = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run(RunRequest::new("q", "healthy"), CancellationToken::new(), None),
        )
        .await
        .expect("healthy run must not wait on the stalled model");
        assert_eq!(healthy.status, RunStatus::Succeeded);

        cancel.cancel();
        let stalled = stalled.await.unwrap();
        assert_eq!(stalled.status, RunStatus::Cancelled);
        assert!(manager.list_models().iter().all(|m| m.in_use == 0));
    }

    #[tokio::test]
    async fn test_budget_pressure_evicts_least_recently_used() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_script(["Final Answer: ok"])
                .with_default_footprint(4),
        );
        let (agent, manager) = agent_with(factory.clone(), 8);

        for model in ["alpha", "beta"] {
            let run = agent
                .run(RunRequest::new("q", model), CancellationToken::new(), None)
                .await;
            assert_eq!(run.status, RunStatus::Succeeded);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.memory_usage().used_bytes, 8);

        let run = agent
            .run(RunRequest::new("q", "gamma"), CancellationToken::new(), None)
            .await;
        assert_eq!(run.status, RunStatus::Succeeded);

        assert_eq!(manager.state_of("alpha"), None);
        assert_eq!(manager.state_of("beta"), Some(ModelState::Ready));
        assert_eq!(manager.state_of("gamma"), Some(ModelState::Ready));
        assert_eq!(factory.load_count(), 3);
        assert_eq!(factory.unload_count(), 1);
        assert_eq!(manager.memory_usage().used_bytes, 8);
    }

    #[tokio::test]
    async fn test_oversized_model_fails_run_without_evicting() {
        let factory = Arc::new(
            MockBackendFactory::new()
                .with_script(["Final Answer: ok"])
                .with_default_footprint(2)
                .with_footprint("giant", 100),
        );
        let (agent, manager) = agent_with(factory.clone(), 10);
        let small = agent
            .run(RunRequest::new("q", "small"), CancellationToken::new(), None)
            .await;
        assert_eq!(small.status, RunStatus::Succeeded);

        let giant = agent
            .run(RunRequest::new("q", "giant"), CancellationToken::new(), None)
            .await;
        assert_eq!(giant.status, RunStatus::Failed);
        assert!(giant.final_answer.contains("giant"));
        assert_eq!(manager.state_of("small"), Some(ModelState::Ready));
        assert_eq!(factory.unload_count(), 0);
    }
}
