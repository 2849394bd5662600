use aimatch_core::Paths;

/// Show the last `lines` lines of the operational log.
pub async fn show(paths: &Paths, lines: usize) -> anyhow::Result<()> {
    let log_file = paths.log_file();
    if !log_file.exists() {
        println!("(No logs. The log is written once `aimatch run` starts.)");
        return Ok(());
    }

    let content = std::fs::read_to_string(&log_file)?;
    let tail = tail_lines(&content, lines);

    println!("📋 Logs: {} (last {} lines)", log_file.display(), tail.len());
    println!();
    for line in tail {
        println!("{}", line);
    }
    Ok(())
}

fn tail_lines(content: &str, n: usize) -> Vec<&str> {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(n);
    all[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail_lines("a\n", 5), vec!["a"]);
        assert!(tail_lines("", 3).is_empty());
    }
}
