use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, Ident, LitStr, Type, Visibility, parse_macro_input,
    spanned::Spanned,
};

#[proc_macro_derive(Attributed, attributes(stamp))]
pub fn derive_attributed(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_attributed(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TagOption {
    CreateActorRef,
    CreateActorId,
    UpdateActorRef,
    UpdateActorId,
}

impl TagOption {
    const ALL: [TagOption; 4] = [
        TagOption::CreateActorRef,
        TagOption::CreateActorId,
        TagOption::UpdateActorRef,
        TagOption::UpdateActorId,
    ];

    fn option_name(self) -> &'static str {
        match self {
            TagOption::CreateActorRef => "create_actor_ref",
            TagOption::CreateActorId => "create_actor_id",
            TagOption::UpdateActorRef => "update_actor_ref",
            TagOption::UpdateActorId => "update_actor_id",
        }
    }

    fn tag_tokens(self) -> TokenStream2 {
        match self {
            TagOption::CreateActorRef => quote!(::actorstamp::FieldTag::CreateActorRef),
            TagOption::CreateActorId => quote!(::actorstamp::FieldTag::CreateActorId),
            TagOption::UpdateActorRef => quote!(::actorstamp::FieldTag::UpdateActorRef),
            TagOption::UpdateActorId => quote!(::actorstamp::FieldTag::UpdateActorId),
        }
    }

    fn value_kind_tokens(self) -> TokenStream2 {
        match self {
            TagOption::CreateActorRef | TagOption::UpdateActorRef => {
                quote!(::actorstamp::ValueKind::ActorRef)
            }
            TagOption::CreateActorId | TagOption::UpdateActorId => {
                quote!(::actorstamp::ValueKind::Identifier)
            }
        }
    }

    fn from_path(path: &syn::Path) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|option| path.is_ident(option.option_name()))
    }
}

#[derive(Default)]
struct StampFieldOptions {
    tags: Vec<TagOption>,
    flatten: bool,
}

struct StampStructOptions {
    entity_name: Option<LitStr>,
}

fn expand_attributed(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Attributed does not support generic structs yet",
        ));
    }

    let struct_options = parse_stamp_struct_options(&input.attrs)?;

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Attributed can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        Fields::Unit => syn::FieldsNamed {
            brace_token: Default::default(),
            named: Default::default(),
        },
        Fields::Unnamed(_) => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Attributed requires named fields",
            ));
        }
    };

    let mut accessors = Vec::<TokenStream2>::new();
    let mut slot_checks = Vec::<TokenStream2>::new();
    let mut pushes = Vec::<TokenStream2>::new();

    for field in named_fields.named {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Attributed requires named fields"))?;
        let ty = field.ty;
        let field_name = ident.to_string().trim_start_matches("r#").to_string();
        let visibility = visibility_tokens(&field.vis);
        let options = parse_stamp_field_options(&field.attrs)?;

        if options.tags.is_empty() && !options.flatten {
            pushes.push(quote! {
                fields.push(::actorstamp::FieldDescriptor::untagged(#field_name, #visibility));
            });
            continue;
        }

        let accessor = format_ident!("__stamp_access_{}", field_name);
        accessors.push(accessor_fn(&accessor, &struct_name, &ident, &ty));

        if options.flatten {
            pushes.push(quote! {
                fields.extend(::actorstamp::flatten_fields::<Self, #ty>(
                    #field_name,
                    #visibility,
                    #accessor,
                ));
            });
            continue;
        }

        for tag in &options.tags {
            slot_checks.push(slot_check(&struct_name, &field_name, &ty, *tag));
        }

        let tags = options.tags.iter().map(|tag| tag.tag_tokens());
        pushes.push(quote! {
            fields.push(::actorstamp::FieldDescriptor::tagged(
                #field_name,
                #visibility,
                &[#(#tags),*],
                #accessor,
            ));
        });
    }

    let entity_name_expr = match struct_options.entity_name {
        Some(name) => quote!(#name),
        None => quote!(stringify!(#struct_name)),
    };
    let field_count = pushes.len();

    Ok(quote! {
        #(#slot_checks)*

        impl ::actorstamp::AttributedEntity for #struct_name {
            fn entity_type_name() -> &'static str {
                #entity_name_expr
            }

            fn describe_fields() -> ::std::vec::Vec<::actorstamp::FieldDescriptor<Self>> {
                #(#accessors)*

                #[allow(unused_mut)]
                let mut fields = ::std::vec::Vec::with_capacity(#field_count);
                #(#pushes)*
                fields
            }
        }
    })
}

fn accessor_fn(accessor: &Ident, struct_name: &Ident, field: &Ident, ty: &Type) -> TokenStream2 {
    quote! {
        #[allow(non_snake_case)]
        fn #accessor(entity: &mut #struct_name) -> &mut #ty {
            &mut entity.#field
        }
    }
}

fn slot_check(struct_name: &Ident, field_name: &str, ty: &Type, tag: TagOption) -> TokenStream2 {
    let kind = tag.value_kind_tokens();
    let message = format!(
        "field `{}::{}` is tagged `{}` but its type cannot hold that value",
        struct_name,
        field_name,
        tag.option_name()
    );
    quote! {
        const _: () = ::std::assert!(
            ::actorstamp::__private::slot_accepts::<#ty>(#kind),
            #message
        );
    }
}

fn visibility_tokens(vis: &Visibility) -> TokenStream2 {
    match vis {
        Visibility::Public(_) => quote!(::actorstamp::FieldVisibility::Public),
        Visibility::Restricted(_) => quote!(::actorstamp::FieldVisibility::Restricted),
        Visibility::Inherited => quote!(::actorstamp::FieldVisibility::Private),
    }
}

fn path_ends_with_ident(path: &syn::Path, ident: &str) -> bool {
    path.segments
        .last()
        .map(|segment| segment.ident == ident)
        .unwrap_or(false)
}

fn parse_stamp_field_options(attrs: &[syn::Attribute]) -> syn::Result<StampFieldOptions> {
    let mut options: Option<StampFieldOptions> = None;

    for attr in attrs {
        if !path_ends_with_ident(attr.path(), "stamp") {
            continue;
        }

        if options.is_some() {
            return Err(syn::Error::new(
                attr.span(),
                "Duplicate #[stamp(...)] attribute on field",
            ));
        }

        let mut parsed = StampFieldOptions::default();
        match &attr.meta {
            syn::Meta::List(list) => {
                list.parse_nested_meta(|meta| {
                    if meta.path.is_ident("flatten") {
                        if parsed.flatten {
                            return Err(meta.error("Duplicate #[stamp(flatten)] option"));
                        }
                        parsed.flatten = true;
                        return Ok(());
                    }

                    if let Some(tag) = TagOption::from_path(&meta.path) {
                        if parsed.tags.contains(&tag) {
                            return Err(meta.error(format!(
                                "Duplicate #[stamp({})] option",
                                tag.option_name()
                            )));
                        }
                        parsed.tags.push(tag);
                        return Ok(());
                    }

                    Err(meta.error(
                        "Unsupported #[stamp(...)] option. Supported: create_actor_ref, create_actor_id, update_actor_ref, update_actor_id, flatten",
                    ))
                })?;
            }
            syn::Meta::Path(_) | syn::Meta::NameValue(_) => {
                return Err(syn::Error::new(
                    attr.span(),
                    "Use #[stamp(create_actor_ref)], #[stamp(create_actor_id)], #[stamp(update_actor_ref)], #[stamp(update_actor_id)] or #[stamp(flatten)]",
                ));
            }
        }

        if parsed.flatten && !parsed.tags.is_empty() {
            return Err(syn::Error::new(
                attr.span(),
                "#[stamp(flatten)] cannot be combined with tag options",
            ));
        }

        options = Some(parsed);
    }

    Ok(options.unwrap_or_default())
}

fn parse_stamp_struct_options(attrs: &[syn::Attribute]) -> syn::Result<StampStructOptions> {
    let mut options = StampStructOptions { entity_name: None };

    for attr in attrs {
        if !path_ends_with_ident(attr.path(), "stamp") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("entity") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                options.entity_name = Some(lit);
                return Ok(());
            }

            Err(meta.error("Unsupported #[stamp(...)] struct option. Supported: entity = \"...\""))
        })?;
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn field_attrs(field: syn::Field) -> syn::Result<StampFieldOptions> {
        parse_stamp_field_options(&field.attrs)
    }

    #[test]
    fn parses_several_tags_on_one_field() {
        let field: syn::Field = parse_quote! {
            #[stamp(create_actor_id, update_actor_id)]
            touched_by: Option<String>
        };
        let options = field_attrs(field).unwrap();
        assert!(options.tags == vec![TagOption::CreateActorId, TagOption::UpdateActorId]);
        assert!(!options.flatten);
    }

    #[test]
    fn rejects_duplicate_and_unknown_options() {
        let duplicate: syn::Field = parse_quote! {
            #[stamp(update_actor_id, update_actor_id)]
            updated_by: Option<String>
        };
        assert!(field_attrs(duplicate).is_err());

        let unknown: syn::Field = parse_quote! {
            #[stamp(deleted_by)]
            deleted_by: Option<String>
        };
        assert!(field_attrs(unknown).is_err());

        let repeated: syn::Field = parse_quote! {
            #[stamp(create_actor_id)]
            #[stamp(update_actor_id)]
            touched_by: Option<String>
        };
        assert!(field_attrs(repeated).is_err());
    }

    #[test]
    fn flatten_stands_alone() {
        let mixed: syn::Field = parse_quote! {
            #[stamp(flatten, create_actor_id)]
            blame: Blameable
        };
        assert!(field_attrs(mixed).is_err());

        let bare: syn::Field = parse_quote! {
            #[stamp]
            blame: Blameable
        };
        assert!(field_attrs(bare).is_err());
    }

    #[test]
    fn struct_option_renames_entity() {
        let input: DeriveInput = parse_quote! {
            #[stamp(entity = "audit_log")]
            struct AuditLog {
                #[stamp(create_actor_id)]
                created_by: Option<String>,
            }
        };
        let options = parse_stamp_struct_options(&input.attrs).unwrap();
        assert_eq!(options.entity_name.unwrap().value(), "audit_log");

        let generic: DeriveInput = parse_quote! {
            struct Wrapper<T> { inner: T }
        };
        assert!(expand_attributed(generic).is_err());

        let tuple: DeriveInput = parse_quote! {
            struct Pair(String, String);
        };
        assert!(expand_attributed(tuple).is_err());
    }
}
