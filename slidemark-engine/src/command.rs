use std::collections::HashMap;

use crate::errors::EngineError;
use crate::session::EditSession;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    /// 解析 `name` 或 `name=arg` 形式的命令行参数。
    pub fn parse(text: &str) -> Self {
        match text.split_once('=') {
            Some((name, arg)) => Self {
                name: name.trim().to_string(),
                args: vec![arg.trim().to_string()],
            },
            None => Self {
                name: text.trim().to_string(),
                args: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub session: &'a mut EditSession,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(SelectAllCommand);
        bus.register(DeselectAllCommand);
        bus.register(DeleteSelectedCommand);
        bus.register(AssignGroupCommand);
        bus.register(ToggleEditModeCommand);
        bus.register(CancelSplitCommand);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

struct SelectAllCommand;

impl CommandHandler for SelectAllCommand {
    fn name(&self) -> &'static str {
        "select_all"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.session.select_all();
        CommandResponse::ok(format!(
            "已选中 {} 个标注",
            context.session.selected_count()
        ))
    }
}

struct DeselectAllCommand;

impl CommandHandler for DeselectAllCommand {
    fn name(&self) -> &'static str {
        "deselect_all"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.session.deselect_all();
        CommandResponse::ok("选中集已清空")
    }
}

struct DeleteSelectedCommand;

impl CommandHandler for DeleteSelectedCommand {
    fn name(&self) -> &'static str {
        "delete_selected"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let removed = context.session.delete_selected_annotations();
        CommandResponse::ok(format!("已删除 {removed} 个标注"))
    }
}

/// `assign_group=<分组名>`：把选中标注归入指定分组。
struct AssignGroupCommand;

impl CommandHandler for AssignGroupCommand {
    fn name(&self) -> &'static str {
        "assign_group"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let Some(group_name) = request.args.first() else {
            return CommandResponse::err("assign_group 需要分组名参数");
        };
        match context.session.assign_selected_to_group_named(group_name) {
            Ok(changed) => CommandResponse::ok(format!("{changed} 个标注已归入分组 {group_name}")),
            Err(EngineError::GroupNameNotFound(name)) => {
                CommandResponse::err(format!("未找到分组: {name}"))
            }
            Err(error) => CommandResponse::err(error.to_string()),
        }
    }
}

struct ToggleEditModeCommand;

impl CommandHandler for ToggleEditModeCommand {
    fn name(&self) -> &'static str {
        "toggle_edit_mode"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if context.session.toggle_edit_mode() {
            CommandResponse::ok("已进入编辑模式")
        } else {
            CommandResponse::ok("已退出编辑模式")
        }
    }
}

struct CancelSplitCommand;

impl CommandHandler for CancelSplitCommand {
    fn name(&self) -> &'static str {
        "cancel_split"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.session.cancel_split();
        CommandResponse::ok("已退出拆分模式")
    }
}

#[cfg(test)]
mod tests {
    use slidemark_core::annotation::{Annotation, AnnotationSet, AnnotationType, GroupId};
    use slidemark_core::geometry::{Point2, Vector2};

    use super::*;
    use crate::session::EditConfig;

    fn session_with_two_points() -> EditSession {
        let mut set = AnnotationSet::new(Vector2::new(1.0, 1.0));
        let store = set.store_mut();
        store.add_group("Tumor");
        for x in [0.0, 50.0] {
            store.push_annotation(Annotation::new(
                AnnotationType::Point,
                vec![Point2::new(x, 0.0)],
                GroupId::NONE,
            ));
        }
        EditSession::new(set, EditConfig::default())
    }

    #[test]
    fn parse_splits_optional_argument() {
        let request = CommandRequest::parse("assign_group=Tumor");
        assert_eq!(request.name, "assign_group");
        assert_eq!(request.args, vec!["Tumor".to_string()]);
        assert!(CommandRequest::parse("select_all").args.is_empty());
    }

    #[test]
    fn selection_and_group_commands_work() {
        let mut session = session_with_two_points();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            session: &mut session,
        };

        let response = bus.dispatch(&CommandRequest::parse("select_all"), &mut context);
        assert!(response.success);
        assert_eq!(context.session.selected_count(), 2);

        let response = bus.dispatch(&CommandRequest::parse("assign_group=Tumor"), &mut context);
        assert!(response.success, "{:?}", response.message);
        let tumor = context
            .session
            .annotations()
            .store()
            .find_group_by_name("Tumor")
            .unwrap();
        assert!(
            context
                .session
                .annotations()
                .store()
                .annotations()
                .all(|(_, annotation)| annotation.group_id == tumor)
        );

        let response = bus.dispatch(&CommandRequest::parse("assign_group=Stroma"), &mut context);
        assert!(!response.success);

        let response = bus.dispatch(&CommandRequest::parse("delete_selected"), &mut context);
        assert!(response.success);
        assert_eq!(context.session.annotations().store().annotation_count(), 0);
    }

    #[test]
    fn mode_commands_and_unknown_command() {
        let mut session = session_with_two_points();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            session: &mut session,
        };
        assert!(bus.dispatch(&CommandRequest::parse("toggle_edit_mode"), &mut context).success);
        assert!(context.session.is_edit_mode());
        assert!(bus.dispatch(&CommandRequest::parse("cancel_split"), &mut context).success);
        assert!(!context.session.annotations().edit.is_split_mode);
        assert!(!bus.dispatch(&CommandRequest::parse("explode"), &mut context).success);
        assert_eq!(bus.available_commands().count(), 6);
    }
}
