use crate::api::Author;

/// Who is looking at the comments. Passed explicitly to every view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub handle: String,
    pub display_name: String,
    pub avatar_url: Option<String>,

    /// Bearer token for the post service, `None` when signed out
    pub token: Option<String>,
}

impl Session {
    pub fn new(author: Author, token: String) -> Session {
        Session {
            handle: author.handle,
            display_name: author.display_name,
            avatar_url: author.avatar_url,
            token: Some(token),
        }
    }

    pub fn anonymous() -> Session {
        Session {
            handle: String::new(),
            display_name: String::new(),
            avatar_url: None,
            token: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn author(&self) -> Author {
        Author {
            display_name: self.display_name.clone(),
            handle: self.handle.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }

    pub fn owns(&self, author: &Author) -> bool {
        self.is_authenticated() && author.handle == self.handle
    }
}
