//! SeaORM entity models
//!
//! Two-layer template graph (ideal/custom), versioned sources and deliverables

mod project;
mod ideal_template;
mod ideal_section;
mod ideal_mapping;
mod custom_template;
mod custom_section;
mod custom_mapping;
mod source_document;
mod source_section;
mod study_global;
mod deliverable;
mod deliverable_section;
mod deliverable_section_history;

pub use project::{
    Entity as ProjectEntity,
    Model as Project,
    ActiveModel as ProjectActiveModel,
    Column as ProjectColumn,
};

pub use ideal_template::{
    Entity as IdealTemplateEntity,
    Model as IdealTemplate,
    ActiveModel as IdealTemplateActiveModel,
    Column as IdealTemplateColumn,
};

pub use ideal_section::{
    Entity as IdealSectionEntity,
    Model as IdealSection,
    ActiveModel as IdealSectionActiveModel,
    Column as IdealSectionColumn,
};

pub use ideal_mapping::{
    Entity as IdealMappingEntity,
    Model as IdealMapping,
    ActiveModel as IdealMappingActiveModel,
    Column as IdealMappingColumn,
};

pub use custom_template::{
    Entity as CustomTemplateEntity,
    Model as CustomTemplate,
    ActiveModel as CustomTemplateActiveModel,
    Column as CustomTemplateColumn,
};

pub use custom_section::{
    Entity as CustomSectionEntity,
    Model as CustomSection,
    ActiveModel as CustomSectionActiveModel,
    Column as CustomSectionColumn,
};

pub use custom_mapping::{
    Entity as CustomMappingEntity,
    Model as CustomMapping,
    ActiveModel as CustomMappingActiveModel,
    Column as CustomMappingColumn,
};

pub use source_document::{
    Entity as SourceDocumentEntity,
    Model as SourceDocument,
    ActiveModel as SourceDocumentActiveModel,
    Column as SourceDocumentColumn,
    DocumentStatus,
};

pub use source_section::{
    Entity as SourceSectionEntity,
    Model as SourceSection,
    ActiveModel as SourceSectionActiveModel,
    Column as SourceSectionColumn,
};

pub use study_global::{
    Entity as StudyGlobalEntity,
    Model as StudyGlobal,
    ActiveModel as StudyGlobalActiveModel,
    Column as StudyGlobalColumn,
};

pub use deliverable::{
    Entity as DeliverableEntity,
    Model as Deliverable,
    ActiveModel as DeliverableActiveModel,
    Column as DeliverableColumn,
};

pub use deliverable_section::{
    Entity as DeliverableSectionEntity,
    Model as DeliverableSection,
    ActiveModel as DeliverableSectionActiveModel,
    Column as DeliverableSectionColumn,
    SectionStatus,
};

pub use deliverable_section_history::{
    Entity as SectionHistoryEntity,
    Model as SectionHistory,
    ActiveModel as SectionHistoryActiveModel,
    Column as SectionHistoryColumn,
};
