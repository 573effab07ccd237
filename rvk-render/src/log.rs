//! Routing of validation layer output into [`tracing`].
//!
//! Validation messages are advisory. The messenger callback only logs and
//! always tells the driver to continue.

use std::ffi::CStr;

use ash::vk;

/// `tracing` target used for every forwarded validation message.
pub const VALIDATION_TARGET: &str = "rvk-validation";

/// Minimum severity of validation layer messages to forward.
///
/// `None` in configuration means diagnostics are off entirely: no
/// validation layer and no messenger. Variants are ordered least to most
/// severe.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    /// All severities at or above `self`.
    pub fn severity_mask(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
        match self {
            Self::Verbose => {
                Sev::VERBOSE | Sev::INFO | Sev::WARNING | Sev::ERROR
            }
            Self::Info => Sev::INFO | Sev::WARNING | Sev::ERROR,
            Self::Warning => Sev::WARNING | Sev::ERROR,
            Self::Error => Sev::ERROR,
        }
    }
}

/// Messenger create info forwarding everything at or above `level`.
pub(crate) fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(level.severity_mask())
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_validation_message))
}

fn message_type_label(ty: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if ty.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if ty.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else if ty.contains(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL) {
        "general"
    } else {
        "unknown"
    }
}

unsafe extern "system" fn forward_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the layer hands us a valid callback data pointer for the
    // duration of this call; null was checked above.
    let data = unsafe { &*p_callback_data };
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        // SAFETY: p_message is a null terminated string owned by the layer
        // for the duration of the callback.
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };
    let kind = message_type_label(message_type);

    use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
    if severity.contains(Sev::ERROR) {
        tracing::error!(target: VALIDATION_TARGET, kind, "{message}");
    } else if severity.contains(Sev::WARNING) {
        tracing::warn!(target: VALIDATION_TARGET, kind, "{message}");
    } else if severity.contains(Sev::INFO) {
        tracing::info!(target: VALIDATION_TARGET, kind, "{message}");
    } else {
        tracing::trace!(target: VALIDATION_TARGET, kind, "{message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;

    #[test]
    fn warning_level_forwards_warnings_and_errors_only() {
        let mask = VulkanLogLevel::Warning.severity_mask();
        assert!(mask.contains(Sev::WARNING | Sev::ERROR));
        assert!(!mask.contains(Sev::INFO));
        assert!(!mask.contains(Sev::VERBOSE));
    }

    #[test]
    fn lower_levels_are_supersets_of_higher_ones() {
        let levels = [
            VulkanLogLevel::Verbose,
            VulkanLogLevel::Info,
            VulkanLogLevel::Warning,
            VulkanLogLevel::Error,
        ];
        for pair in levels.windows(2) {
            let (low, high) = (pair[0], pair[1]);
            assert!(low < high);
            assert!(low.severity_mask().contains(high.severity_mask()));
        }
    }

    #[test]
    fn validation_label_wins_over_general() {
        use vk::DebugUtilsMessageTypeFlagsEXT as Ty;
        assert_eq!(message_type_label(Ty::GENERAL | Ty::VALIDATION), "validation");
        assert_eq!(message_type_label(Ty::PERFORMANCE), "performance");
        assert_eq!(message_type_label(Ty::empty()), "unknown");
    }
}
