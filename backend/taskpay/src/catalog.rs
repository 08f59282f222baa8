//! Built-in quiz tasks.

use crate::errors::{Result, TaskPayError};
use crate::models::{Amount, Task};

/// (id, title, description, duration in seconds, reward in KES)
const BUILTIN: [(&str, &str, &str, u32, i64); 10] = [
    (
        "task1",
        "Climate Action Quiz",
        "Test your knowledge on global climate change efforts and renewable energy solutions.",
        120,
        25,
    ),
    (
        "task2",
        "AI Revolution Trivia",
        "How much do you know about artificial intelligence and its impact on jobs?",
        90,
        22,
    ),
    (
        "task3",
        "Global Health Awareness",
        "Learn about recent advancements in global health and answer a short quiz.",
        135,
        28,
    ),
    (
        "task4",
        "Social Media Trends Quiz",
        "Are you up to date with 2025's social media platforms and influencers?",
        100,
        20,
    ),
    (
        "task5",
        "Sustainable Fashion Challenge",
        "Quiz yourself on eco-friendly fashion brands and practices.",
        145,
        27,
    ),
    (
        "task6",
        "Tech Innovations 2025",
        "Explore cutting-edge tech like quantum computing and take a quiz.",
        110,
        30,
    ),
    (
        "task7",
        "Cultural Heritage Quiz",
        "Test your knowledge of global cultural landmarks and traditions.",
        130,
        23,
    ),
    (
        "task8",
        "Renewable Energy Trivia",
        "How well do you know solar, wind, and hydro power? Find out!",
        95,
        26,
    ),
    (
        "task9",
        "Digital Privacy Quiz",
        "Learn about protecting your data online with this quick quiz.",
        140,
        24,
    ),
    (
        "task10",
        "Space Exploration Quiz",
        "Dive into the latest space missions and test your cosmic knowledge.",
        115,
        29,
    ),
];

#[derive(Debug, Clone)]
pub struct Catalog {
    tasks: Vec<Task>,
}

impl Catalog {
    pub fn new(tasks: Vec<Task>) -> Self {
        Catalog { tasks }
    }

    pub fn builtin() -> Self {
        let tasks = BUILTIN
            .iter()
            .map(|&(id, title, description, duration_secs, reward)| Task {
                id: id.to_string(),
                title: title.to_string(),
                description: description.to_string(),
                reward: Amount::kes(reward),
                duration_secs,
                external_link: None,
            })
            .collect();
        Self::new(tasks)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, task_id: &str) -> Result<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| TaskPayError::TaskNotFound(task_id.to_string()))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_ten_unique_tasks() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.tasks().len(), 10);

        let mut ids: Vec<_> = catalog.tasks().iter().map(|t| t.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert!(catalog
            .tasks()
            .iter()
            .all(|t| t.duration_secs > 0 && t.reward.is_positive()));
    }

    #[test]
    fn lookup_by_id() {
        let catalog = Catalog::builtin();
        let task = catalog.get("task6").unwrap();
        assert_eq!(task.title, "Tech Innovations 2025");
        assert_eq!(task.reward, Amount::kes(30));
        assert_eq!(task.duration_secs, 110);

        assert!(matches!(
            catalog.get("task11"),
            Err(TaskPayError::TaskNotFound(id)) if id == "task11"
        ));
    }
}
