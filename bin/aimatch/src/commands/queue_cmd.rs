use super::open_store;
use aimatch_core::{Config, Paths, Task, TaskId, TaskStatus};

pub async fn list(paths: &Paths, status: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;
    let store = open_store(&config, paths)?;

    let tasks = match status {
        Some(s) => {
            let status = TaskStatus::from_str(s)
                .ok_or_else(|| anyhow::anyhow!("unknown status '{}'", s))?;
            store.list_by_status(status)?
        }
        None => store.list_all()?,
    };

    if tasks.is_empty() {
        println!("(No tasks)");
        return Ok(());
    }

    println!("{:>8}  {:<10}  {:>8}  {}", "ID", "STATUS", "ATTEMPTS", "URL");
    for task in &tasks {
        print_row(task);
    }
    println!();
    println!("{} task(s)", tasks.len());
    Ok(())
}

fn print_row(task: &Task) {
    println!(
        "{:>8}  {:<10}  {:>8}  {}",
        task.id, task.status, task.attempts, task.competitor_url
    );
    println!("{:>8}  {:<10}  {:>8}  ↳ {}", "", "", "", task.client_url);
    if let Some(err) = &task.last_error {
        println!("{:>8}  {:<10}  {:>8}  last error: {}", "", "", "", err);
    }
}

pub async fn requeue(paths: &Paths, id: i64) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;
    let store = open_store(&config, paths)?;

    if store.requeue(TaskId(id))? {
        println!("✓ Task {} is PENDING again", id);
    } else {
        println!("✗ No task with id {}", id);
    }
    Ok(())
}
