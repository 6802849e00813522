/// Named screens of the simulated phone.
pub const HOME: &str = "home";
pub const SCREENS: [&str; 5] = [HOME, "settings", "phone", "messages", "chat"];

/// Tracks which screen is visible. Exactly one screen is shown at a time.
#[derive(Debug, Clone)]
pub struct ViewRouter {
    screens: Vec<String>,
    home: String,
    active: String,
}

impl ViewRouter {
    pub fn new(screens: impl IntoIterator<Item = impl Into<String>>, home: impl Into<String>) -> Self {
        let home = home.into();
        let mut screens: Vec<String> = screens.into_iter().map(Into::into).collect();
        if !screens.contains(&home) {
            screens.push(home.clone());
        }
        Self {
            screens,
            active: home.clone(),
            home,
        }
    }

    /// Shows `screen_id`. Unknown ids leave the current screen in place and
    /// return `false`.
    pub fn open(&mut self, screen_id: &str) -> bool {
        if !self.screens.iter().any(|s| s == screen_id) {
            log::debug!("Ignoring unknown screen: {}", screen_id);
            return false;
        }
        self.active = screen_id.to_string();
        true
    }

    pub fn go_home(&mut self) {
        self.active = self.home.clone();
    }

    pub fn current(&self) -> &str {
        &self.active
    }

    pub fn screens(&self) -> &[String] {
        &self.screens
    }
}

impl Default for ViewRouter {
    fn default() -> Self {
        Self::new(SCREENS, HOME)
    }
}
