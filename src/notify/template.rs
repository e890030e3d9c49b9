use crate::error::{AppError, Result};
use crate::models::{Task, TaskRun};
use minijinja::{Environment, context};

/// Everything a template may see. minijinja templates can only reach what
/// is passed in here, which sandboxes operator-authored command/description
/// text away from the process.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub task: &'a Task,
    pub run: &'a TaskRun,
    pub base_url: Option<&'a str>,
    pub run_url: Option<&'a str>,
}

/// Renders notification name/text templates. Rendering the same template
/// with an identical context always yields identical output.
pub struct NotificationRenderer {
    env: Environment<'static>,
}

impl NotificationRenderer {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    pub fn render(&self, template: &str, ctx: &RenderContext<'_>) -> Result<String> {
        self.env
            .render_str(
                template,
                context! {
                    task => ctx.task,
                    run => ctx.run,
                    work_status => ctx.run.work_status().as_str(),
                    base_url => ctx.base_url,
                    run_url => ctx.run_url,
                },
            )
            .map_err(|e| AppError::Notification(format!("Template render failed: {e}")))
    }
}

impl Default for NotificationRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use chrono::Utc;

    fn sample() -> (Task, TaskRun) {
        let task = Task {
            id: 7,
            name: "ping".to_string(),
            command: "ping 127.0.0.1".to_string(),
            description: None,
            cron: None,
            is_enabled: true,
            is_infinite: false,
            create_date: Utc::now(),
        };
        let run = TaskRun {
            id: 1,
            task_id: 7,
            seq: 3,
            command: task.command.clone(),
            status: RunStatus::Finished,
            process_id: Some(1234),
            process_return_code: Some(1),
            scheduled_date: None,
            create_date: Utc::now(),
            start_date: Some(Utc::now()),
            finish_date: Some(Utc::now()),
            stop_reason: None,
        };
        (task, run)
    }

    #[test]
    fn renders_task_and_run_fields() {
        let (task, run) = sample();
        let renderer = NotificationRenderer::new();
        let ctx = RenderContext {
            task: &task,
            run: &run,
            base_url: Some("http://localhost:8080"),
            run_url: None,
        };

        let text = renderer
            .render(
                "Task {{ task.name }} run #{{ run.seq }}: {{ work_status }} \
                 (rc={{ run.process_return_code }})",
                &ctx,
            )
            .unwrap();
        assert_eq!(text, "Task ping run #3: failed (rc=1)");
    }

    #[test]
    fn rendering_twice_is_deterministic() {
        let (task, run) = sample();
        let renderer = NotificationRenderer::new();
        let ctx = RenderContext {
            task: &task,
            run: &run,
            base_url: None,
            run_url: Some("http://localhost:8080/task/7/run/3"),
        };

        let template = "{{ task.name }} #{{ run.seq }} {{ run_url }}";
        let first = renderer.render(template, &ctx).unwrap();
        let second = renderer.render(template, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn broken_template_is_an_error() {
        let (task, run) = sample();
        let renderer = NotificationRenderer::new();
        let ctx = RenderContext {
            task: &task,
            run: &run,
            base_url: None,
            run_url: None,
        };

        assert!(renderer.render("{{ task.name", &ctx).is_err());
    }
}
